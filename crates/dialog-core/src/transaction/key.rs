//! # Transaction identifiers
//!
//! RFC 3261 matches messages to transactions with different field subsets
//! depending on direction and method (§17.1.3 for responses, §17.2.3 for
//! requests). A [`TransactionKey`] always carries the Call-ID, CSeq number and
//! From tag; [`KeyFields`] selects which of the CSeq method, top Via branch and
//! To tag take part. Two keys are equal only when every field is equal, so
//! the same message yields different keys under different field selections.

use std::fmt;

use b2bua_sip_core::{HeaderAccess, Method};

use crate::errors::DialogResult;

/// Field selection for [`TransactionKey::from_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFields {
    pub cseq_method: bool,
    pub branch: bool,
    pub to_tag: bool,
}

impl KeyFields {
    /// Client transactions and the responses that match them; also the key of
    /// a fresh server transaction
    pub const METHOD_BRANCH: KeyFields = KeyFields {
        cseq_method: true,
        branch: true,
        to_tag: false,
    };

    /// ACK for a 2xx or a non-2xx final: the branch may differ from the
    /// INVITE's but the To tag is known
    pub const TO_TAG: KeyFields = KeyFields {
        cseq_method: false,
        branch: false,
        to_tag: true,
    };
}

/// Hashable transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub call_id: String,
    pub cseq: u32,
    pub cseq_method: Option<Method>,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub branch: Option<String>,
}

impl TransactionKey {
    /// Compute the key of `msg` with the selected fields
    pub fn from_message<M: HeaderAccess>(msg: &M, fields: KeyFields) -> DialogResult<Self> {
        let cseq = msg.cseq()?;
        let branch = if fields.branch {
            msg.top_via()?.branch().map(str::to_string)
        } else {
            None
        };
        let to_tag = if fields.to_tag {
            msg.to_addr()?.tag().map(str::to_string)
        } else {
            None
        };
        Ok(TransactionKey {
            call_id: msg.call_id()?.to_string(),
            cseq: cseq.seq,
            cseq_method: fields.cseq_method.then(|| cseq.method.clone()),
            from_tag: msg.from_addr()?.tag().map(str::to_string),
            to_tag,
            branch,
        })
    }

    /// Same key with the CSeq method replaced; CANCEL finds its INVITE this way
    pub fn with_method(mut self, method: Method) -> Self {
        self.cseq_method = Some(method);
        self
    }

    /// This key once per Via of `msg`, each time with that Via's branch. A
    /// request of ours that comes back through proxies carries our Via below
    /// theirs.
    pub fn via_candidates<M: HeaderAccess>(&self, msg: &M) -> Vec<Self> {
        msg.vias()
            .into_iter()
            .map(|via| TransactionKey {
                branch: via.branch().map(str::to_string),
                ..self.clone()
            })
            .collect()
    }

    /// Key of an INVITE server transaction once its final response went out:
    /// branch and method dropped, To tag fixed, so the ACK matches whatever
    /// branch it carries
    pub fn ack_key(&self, to_tag: &str) -> Self {
        TransactionKey {
            call_id: self.call_id.clone(),
            cseq: self.cseq,
            cseq_method: None,
            from_tag: self.from_tag.clone(),
            to_tag: Some(to_tag.to_string()),
            branch: None,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.call_id, self.cseq)?;
        if let Some(method) = &self.cseq_method {
            write!(f, ":{}", method)?;
        }
        if let Some(tag) = &self.from_tag {
            write!(f, ";ft={}", tag)?;
        }
        if let Some(tag) = &self.to_tag {
            write!(f, ";tt={}", tag)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";br={}", branch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2bua_sip_core::Request;

    const INVITE: &[u8] = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn test_key_is_stable() {
        let req = Request::parse(INVITE).unwrap();
        let again = Request::parse(INVITE).unwrap();
        for fields in [KeyFields::METHOD_BRANCH, KeyFields::TO_TAG, KeyFields::default()] {
            assert_eq!(
                TransactionKey::from_message(&req, fields).unwrap(),
                TransactionKey::from_message(&again, fields).unwrap()
            );
        }
    }

    #[test]
    fn test_field_selection() {
        let req = Request::parse(INVITE).unwrap();
        let key = TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH).unwrap();
        assert_eq!(key.cseq_method, Some(Method::Invite));
        assert_eq!(key.branch.as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(key.from_tag.as_deref(), Some("1928301774"));
        assert!(key.to_tag.is_none());

        let by_tag = TransactionKey::from_message(&req, KeyFields::TO_TAG).unwrap();
        assert_ne!(key, by_tag);
        assert!(by_tag.branch.is_none());
    }

    #[test]
    fn test_cancel_maps_to_invite() {
        let req = Request::parse(INVITE).unwrap();
        let cancel = req.gen_cancel().unwrap();
        let invite_key = TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH).unwrap();
        let cancel_key = TransactionKey::from_message(&cancel, KeyFields::METHOD_BRANCH)
            .unwrap()
            .with_method(Method::Invite);
        assert_eq!(invite_key, cancel_key);
    }

    #[test]
    fn test_via_candidates_cover_every_hop() {
        let text = std::str::from_utf8(INVITE).unwrap().replacen(
            "Via: ",
            "Via: SIP/2.0/UDP proxy.biloxi.com;branch=z9hG4bKproxy1\r\nVia: ",
            1,
        );
        let req = Request::parse(text.as_bytes()).unwrap();
        let key = TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH).unwrap();
        let branches: Vec<Option<String>> = key
            .via_candidates(&req)
            .into_iter()
            .map(|k| k.branch)
            .collect();
        assert_eq!(
            branches,
            [Some("z9hG4bKproxy1".to_string()), Some("z9hG4bK776asdhds".to_string())]
        );

        let original = Request::parse(INVITE).unwrap();
        let ours = TransactionKey::from_message(&original, KeyFields::METHOD_BRANCH).unwrap();
        assert!(key.via_candidates(&req).contains(&ours));
    }

    #[test]
    fn test_ack_key() {
        let req = Request::parse(INVITE).unwrap();
        let key = TransactionKey::from_message(&req, KeyFields::METHOD_BRANCH).unwrap();
        let mut ack = req.clone();
        ack.to_addr_mut().unwrap().set_tag("314");
        let ack_key = TransactionKey::from_message(&ack, KeyFields::TO_TAG).unwrap();
        assert_eq!(key.ack_key("314"), ack_key);
    }
}
