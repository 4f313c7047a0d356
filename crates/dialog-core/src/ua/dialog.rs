//! Dialog identity of one call leg (RFC 3261 §12)

use b2bua_sip_core::{Address, CSeq, HeaderAccess, HostPort, Method, Request, Response, SipHeader, SipUri};

use crate::errors::DialogResult;
use crate::transaction::routing::{compute_route, remote_target, uac_route_set};

/// Call-ID, tags, URIs, CSeq counters and route set of a call leg
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    /// Our address of record, without tag
    pub local_uri: Address,
    pub remote_uri: Address,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    pub remote_target: SipUri,
    pub route_set: Vec<Address>,
    /// Whether we sent the dialog-creating INVITE
    pub is_initiator: bool,
    /// Top Via branch of the INVITE a UAS dialog answers
    pub invite_branch: Option<String>,
}

impl Dialog {
    /// Dialog of a UAS answering `invite`
    pub fn from_invite(invite: &Request, use_source: bool) -> DialogResult<Self> {
        let from = invite.from_addr()?;
        let mut local_uri = invite.to_addr()?.clone();
        local_uri.remove_tag();
        let mut remote_uri = from.clone();
        remote_uri.remove_tag();
        let mut remote_target = invite
            .contact()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| from.uri.clone());
        if use_source {
            if let Some(source) = &invite.source {
                remote_target.host = source.host.clone();
                remote_target.port = Some(source.port);
            }
        }
        Ok(Dialog {
            call_id: invite.call_id()?.to_string(),
            local_uri,
            remote_uri,
            local_tag: Address::gen_tag(),
            remote_tag: from.tag().map(str::to_string),
            local_cseq: 0,
            remote_cseq: Some(invite.cseq()?.seq),
            remote_target,
            route_set: invite.record_routes().into_iter().cloned().collect(),
            is_initiator: false,
            invite_branch: invite.top_via()?.branch().map(str::to_string),
        })
    }

    /// Dialog of a UAC about to send an INVITE to `remote_target`
    pub fn new_uac(call_id: &str, local_uri: Address, remote_uri: Address) -> Self {
        Dialog {
            call_id: call_id.to_string(),
            remote_target: remote_uri.uri.clone(),
            local_uri,
            remote_uri,
            local_tag: Address::gen_tag(),
            remote_tag: None,
            local_cseq: 0,
            remote_cseq: None,
            route_set: Vec::new(),
            is_initiator: true,
            invite_branch: None,
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Learn the remote tag, target and route set from a response to our
    /// INVITE. Only the first response that establishes the dialog sets the
    /// route set; 2xx responses always refresh the target.
    pub fn update_from_response(&mut self, resp: &Response) {
        let tag = resp.to_addr().ok().and_then(Address::tag).map(str::to_string);
        if tag.is_none() {
            return;
        }
        let establishing = self.remote_tag.is_none();
        if establishing || resp.is_success() {
            self.remote_tag = tag;
            self.remote_target = remote_target(resp, &self.remote_target);
        }
        if establishing || (resp.is_success() && self.route_set.is_empty()) {
            self.route_set = uac_route_set(resp);
        }
    }

    /// Check an in-dialog request's CSeq and remember it. Requests going
    /// backwards return `false`.
    pub fn accept_remote_cseq(&mut self, cseq: u32) -> bool {
        match self.remote_cseq {
            Some(last) if cseq < last => false,
            _ => {
                self.remote_cseq = Some(cseq);
                true
            }
        }
    }

    pub fn local_address(&self) -> Address {
        self.local_uri.clone().with_tag(&self.local_tag)
    }

    pub fn remote_address(&self) -> Address {
        let mut remote = self.remote_uri.clone();
        if let Some(tag) = &self.remote_tag {
            remote.set_tag(tag);
        }
        remote
    }

    /// Whether `req` belongs to this dialog. Requests without a To tag are
    /// ours only when they carry the branch of the INVITE we answer.
    pub fn matches(&self, req: &Request) -> bool {
        let Ok(call_id) = req.call_id() else {
            return false;
        };
        let to_tag = req.to_addr().ok().and_then(Address::tag);
        let from_tag = req.from_addr().ok().and_then(Address::tag);
        if call_id != self.call_id
            || (self.remote_tag.is_some() && from_tag != self.remote_tag.as_deref())
        {
            return false;
        }
        match to_tag {
            Some(tag) => tag == self.local_tag,
            None => {
                let branch = req.top_via().ok().and_then(|v| v.branch());
                branch.is_some() && branch == self.invite_branch.as_deref()
            }
        }
    }

    /// New in-dialog request and its next hop. ACK and CANCEL reuse the
    /// current CSeq, everything else takes the next one.
    pub fn gen_request(&mut self, method: Method, outbound_proxy: Option<&HostPort>) -> (Request, HostPort) {
        let decision = compute_route(&self.route_set, &self.remote_target, outbound_proxy);
        let cseq = match method {
            Method::Ack | Method::Cancel => self.local_cseq,
            _ => self.next_cseq(),
        };
        let mut req = Request::new(method.clone(), decision.request_uri);
        req.append_header(SipHeader::From(self.local_address()));
        req.append_header(SipHeader::To(self.remote_address()));
        req.append_header(SipHeader::CallId(self.call_id.clone()));
        req.append_header(SipHeader::CSeq(CSeq::new(cseq, method)));
        for route in decision.routes {
            req.append_header(SipHeader::Route(route));
        }
        (req, decision.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@192.0.2.4 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKnashds8\r\n\
Record-Route: <sip:p2.example.com;lr>\r\n\
Record-Route: <sip:p1.example.com;lr>\r\n\
From: \"Alice\" <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: <sip:bob@biloxi.com>\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@192.0.2.1:5070>\r\n\
Content-Length: 0\r\n\r\n";

    fn invite() -> Request {
        Request::parse(INVITE.as_bytes()).unwrap()
    }

    #[test]
    fn test_uas_dialog_from_invite() {
        let dialog = Dialog::from_invite(&invite(), false).unwrap();
        assert_eq!(dialog.call_id, "a84b4c76e66710");
        assert_eq!(dialog.remote_tag.as_deref(), Some("1928301774"));
        assert_eq!(dialog.remote_cseq, Some(314159));
        assert_eq!(dialog.remote_target.port, Some(5070));
        // UAS keeps Record-Route order
        assert_eq!(dialog.route_set[0].uri.host, "p2.example.com");
        assert!(dialog.local_uri.tag().is_none());
        assert!(!dialog.is_initiator);
    }

    #[test]
    fn test_in_dialog_request_from_uas() {
        let mut dialog = Dialog::from_invite(&invite(), false).unwrap();
        let (bye, next_hop) = dialog.gen_request(Method::Bye, None);
        assert_eq!(bye.cseq().unwrap().seq, 1);
        assert_eq!(bye.from_addr().unwrap().tag(), Some(dialog.local_tag.as_str()));
        assert_eq!(bye.to_addr().unwrap().tag(), Some("1928301774"));
        assert_eq!(bye.uri.port, Some(5070));
        assert_eq!(bye.routes().len(), 2);
        assert_eq!(next_hop, HostPort::new("p2.example.com", 5060));
    }

    #[test]
    fn test_remote_cseq_must_not_go_backwards() {
        let mut dialog = Dialog::from_invite(&invite(), false).unwrap();
        assert!(dialog.accept_remote_cseq(314160));
        assert!(!dialog.accept_remote_cseq(314158));
        assert!(dialog.accept_remote_cseq(314160));
    }

    #[test]
    fn test_nat_traversal_uses_source() {
        let mut req = invite();
        req.source = Some(HostPort::new("198.51.100.7", 40000));
        let dialog = Dialog::from_invite(&req, true).unwrap();
        assert_eq!(dialog.remote_target.host, "198.51.100.7");
        assert_eq!(dialog.remote_target.port, Some(40000));
    }

    #[test]
    fn test_matches_by_tags() {
        let dialog = Dialog::from_invite(&invite(), false).unwrap();
        let mut bye = invite();
        bye.to_addr_mut().unwrap().set_tag(&dialog.local_tag);
        assert!(dialog.matches(&bye));
        bye.from_addr_mut().unwrap().set_tag("other");
        assert!(!dialog.matches(&bye));
    }

    #[test]
    fn test_tagless_request_matches_by_invite_branch() {
        let dialog = Dialog::from_invite(&invite(), false).unwrap();
        assert_eq!(dialog.invite_branch.as_deref(), Some("z9hG4bKnashds8"));
        let same_fork = invite();
        assert!(dialog.matches(&same_fork));

        let mut other_fork = invite();
        other_fork.top_via_mut().unwrap().set_branch("z9hG4bKfork2");
        assert!(!dialog.matches(&other_fork));

        // A UAC dialog has no INVITE of the peer's to compare against
        let uac = Dialog::new_uac("a84b4c76e66710", dialog.remote_uri.clone(), dialog.local_uri.clone());
        assert!(!uac.matches(&invite()));
    }
}
