//! # SIP messages
//!
//! [`Request`] and [`Response`] keep their headers in wire order as a list of
//! [`SipHeader`] values. Typed accessors come from the [`HeaderAccess`]
//! trait, which both message kinds implement, so code that only cares about
//! dialog identity (Call-ID, tags, CSeq, Via) can be written once.
//!
//! Messages built from the network also carry where they came from and when
//! they arrived; neither is serialized.

use std::fmt;

use b2bua_infra_common::MonoTime;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::parser;
use crate::types::address::Address;
use crate::types::auth::Challenge;
use crate::types::body::MsgBody;
use crate::types::cseq::CSeq;
use crate::types::headers::{HeaderName, SipHeader};
use crate::types::host::HostPort;
use crate::types::method::Method;
use crate::types::rack::RAck;
use crate::types::reason::Reason;
use crate::types::uri::SipUri;
use crate::types::via::Via;

/// Default Max-Forwards for locally originated requests
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Typed access to the headers and body shared by requests and responses
pub trait HeaderAccess {
    fn headers(&self) -> &[SipHeader];
    fn headers_mut(&mut self) -> &mut Vec<SipHeader>;
    fn body(&self) -> Option<&MsgBody>;
    fn body_mut(&mut self) -> Option<&mut MsgBody>;
    fn set_body(&mut self, body: Option<MsgBody>);

    fn from_addr(&self) -> Result<&Address> {
        self.headers()
            .iter()
            .find_map(|h| match h {
                SipHeader::From(a) => Some(a),
                _ => None,
            })
            .ok_or(Error::MissingHeader("From"))
    }

    fn from_addr_mut(&mut self) -> Result<&mut Address> {
        self.headers_mut()
            .iter_mut()
            .find_map(|h| match h {
                SipHeader::From(a) => Some(a),
                _ => None,
            })
            .ok_or(Error::MissingHeader("From"))
    }

    fn to_addr(&self) -> Result<&Address> {
        self.headers()
            .iter()
            .find_map(|h| match h {
                SipHeader::To(a) => Some(a),
                _ => None,
            })
            .ok_or(Error::MissingHeader("To"))
    }

    fn to_addr_mut(&mut self) -> Result<&mut Address> {
        self.headers_mut()
            .iter_mut()
            .find_map(|h| match h {
                SipHeader::To(a) => Some(a),
                _ => None,
            })
            .ok_or(Error::MissingHeader("To"))
    }

    fn call_id(&self) -> Result<&str> {
        self.headers()
            .iter()
            .find_map(|h| match h {
                SipHeader::CallId(id) => Some(id.as_str()),
                _ => None,
            })
            .ok_or(Error::MissingHeader("Call-ID"))
    }

    fn cseq(&self) -> Result<&CSeq> {
        self.headers()
            .iter()
            .find_map(|h| match h {
                SipHeader::CSeq(c) => Some(c),
                _ => None,
            })
            .ok_or(Error::MissingHeader("CSeq"))
    }

    fn top_via(&self) -> Result<&Via> {
        self.headers()
            .iter()
            .find_map(|h| match h {
                SipHeader::Via(v) => Some(v),
                _ => None,
            })
            .ok_or(Error::MissingHeader("Via"))
    }

    fn top_via_mut(&mut self) -> Result<&mut Via> {
        self.headers_mut()
            .iter_mut()
            .find_map(|h| match h {
                SipHeader::Via(v) => Some(v),
                _ => None,
            })
            .ok_or(Error::MissingHeader("Via"))
    }

    fn vias(&self) -> Vec<&Via> {
        self.headers()
            .iter()
            .filter_map(|h| match h {
                SipHeader::Via(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn contacts(&self) -> Vec<&Address> {
        self.headers()
            .iter()
            .filter_map(|h| match h {
                SipHeader::Contact(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn contact(&self) -> Option<&Address> {
        self.contacts().into_iter().next()
    }

    fn routes(&self) -> Vec<&Address> {
        self.headers()
            .iter()
            .filter_map(|h| match h {
                SipHeader::Route(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn record_routes(&self) -> Vec<&Address> {
        self.headers()
            .iter()
            .filter_map(|h| match h {
                SipHeader::RecordRoute(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn max_forwards(&self) -> Option<u32> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::MaxForwards(n) => Some(*n),
            _ => None,
        })
    }

    fn expires(&self) -> Option<u32> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::Expires(n) => Some(*n),
            _ => None,
        })
    }

    fn reason(&self) -> Option<&Reason> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::Reason(r) => Some(r),
            _ => None,
        })
    }

    fn rseq(&self) -> Option<u32> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::RSeq(n) => Some(*n),
            _ => None,
        })
    }

    fn rack(&self) -> Option<&RAck> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::RAck(r) => Some(r),
            _ => None,
        })
    }

    fn refer_to(&self) -> Option<&Address> {
        self.headers().iter().find_map(|h| match h {
            SipHeader::ReferTo(a) => Some(a),
            _ => None,
        })
    }

    /// Whether a `Supported` header lists `option_tag`
    fn supports(&self, option_tag: &str) -> bool {
        self.headers().iter().any(|h| match h {
            SipHeader::Supported(list) => has_token(list, option_tag),
            _ => false,
        })
    }

    /// Whether a `Require` header lists `option_tag`
    fn requires(&self, option_tag: &str) -> bool {
        self.headers().iter().any(|h| match h {
            SipHeader::Require(list) => has_token(list, option_tag),
            _ => false,
        })
    }

    /// Authentication challenges, `true` marking `Proxy-Authenticate`
    fn challenges(&self) -> Vec<(bool, &Challenge)> {
        self.headers()
            .iter()
            .filter_map(|h| match h {
                SipHeader::WwwAuthenticate(c) => Some((false, c)),
                SipHeader::ProxyAuthenticate(c) => Some((true, c)),
                _ => None,
            })
            .collect()
    }

    fn has_header(&self, name: &HeaderName) -> bool {
        self.headers().iter().any(|h| h.is(name))
    }

    /// Raw value of the first header called `name`
    fn header_value(&self, name: &str) -> Option<String> {
        let name: HeaderName = name.parse().ok()?;
        self.headers().iter().find(|h| h.is(&name)).map(|h| {
            let line = h.to_string();
            match line.split_once(": ") {
                Some((_, value)) => value.to_string(),
                None => line,
            }
        })
    }

    fn append_header(&mut self, header: SipHeader) {
        self.headers_mut().push(header);
    }

    /// Insert before any header of the same name
    fn prepend_header(&mut self, header: SipHeader) {
        let name = header.name();
        let headers = self.headers_mut();
        let at = headers.iter().position(|h| h.is(&name)).unwrap_or(headers.len());
        headers.insert(at, header);
    }

    fn remove_headers(&mut self, name: &HeaderName) {
        self.headers_mut().retain(|h| !h.is(name));
    }

    /// Replace every header of the same name with `header`, keeping the
    /// position of the first one
    fn set_header(&mut self, header: SipHeader) {
        let name = header.name();
        let headers = self.headers_mut();
        match headers.iter().position(|h| h.is(&name)) {
            Some(at) => {
                headers[at] = header;
                let mut idx = 0;
                headers.retain(|h| {
                    let keep = idx <= at || !h.is(&name);
                    idx += 1;
                    keep
                });
            }
            None => headers.push(header),
        }
    }
}

fn has_token(list: &str, token: &str) -> bool {
    list.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn validate_common<M: HeaderAccess>(msg: &M) -> Result<()> {
    msg.top_via()?;
    msg.from_addr()?;
    msg.to_addr()?;
    msg.call_id()?;
    msg.cseq()?;
    Ok(())
}

/// SIP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Vec<SipHeader>,
    pub body: Option<MsgBody>,
    /// Transport address the request was received from
    pub source: Option<HostPort>,
    /// Receive time
    pub rtime: Option<MonoTime>,
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self::from_parts(method, uri, Vec::new(), None)
    }

    pub fn from_parts(method: Method, uri: SipUri, headers: Vec<SipHeader>, body: Option<MsgBody>) -> Self {
        Request {
            method,
            uri,
            headers,
            body,
            source: None,
            rtime: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Request> {
        match parser::parse_message(data)? {
            Message::Request(req) => Ok(req),
            Message::Response(_) => Err(Error::Parse("expected a request, got a response".to_string())),
        }
    }

    pub fn with_header(mut self, header: SipHeader) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_body(mut self, body: MsgBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Build a response echoing the headers RFC 3261 §8.2.6.2 requires.
    /// Record-Route is copied for 101-299 so the UAC can learn the route set.
    pub fn gen_response(&self, scode: u16, reason: &str) -> Response {
        let mut resp = Response::new(scode, reason);
        for header in &self.headers {
            let copy = match header {
                SipHeader::Via(_)
                | SipHeader::From(_)
                | SipHeader::To(_)
                | SipHeader::CallId(_)
                | SipHeader::CSeq(_) => true,
                SipHeader::RecordRoute(_) => (101..300).contains(&scode),
                _ => false,
            };
            if copy {
                resp.headers.push(header.clone());
            }
        }
        resp
    }

    /// ACK for a non-2xx final response (RFC 3261 §17.1.1.3): same R-URI,
    /// top Via and Route set as the INVITE, To taken from the response.
    pub fn gen_ack(&self, resp: &Response) -> Result<Request> {
        let cseq = self.cseq()?;
        let mut ack = Request::new(Method::Ack, self.uri.clone());
        ack.headers.push(SipHeader::Via(self.top_via()?.clone()));
        ack.headers.push(SipHeader::From(self.from_addr()?.clone()));
        ack.headers.push(SipHeader::To(resp.to_addr()?.clone()));
        ack.headers.push(SipHeader::CallId(self.call_id()?.to_string()));
        ack.headers.push(SipHeader::CSeq(CSeq::new(cseq.seq, Method::Ack)));
        ack.headers.push(SipHeader::MaxForwards(
            self.max_forwards().unwrap_or(DEFAULT_MAX_FORWARDS),
        ));
        for route in self.routes() {
            ack.headers.push(SipHeader::Route(route.clone()));
        }
        Ok(ack)
    }

    /// CANCEL for this request (RFC 3261 §9.1)
    pub fn gen_cancel(&self) -> Result<Request> {
        let cseq = self.cseq()?;
        let mut cancel = Request::new(Method::Cancel, self.uri.clone());
        cancel.headers.push(SipHeader::Via(self.top_via()?.clone()));
        cancel.headers.push(SipHeader::From(self.from_addr()?.clone()));
        cancel.headers.push(SipHeader::To(self.to_addr()?.clone()));
        cancel.headers.push(SipHeader::CallId(self.call_id()?.to_string()));
        cancel.headers.push(SipHeader::CSeq(CSeq::new(cseq.seq, Method::Cancel)));
        cancel.headers.push(SipHeader::MaxForwards(
            self.max_forwards().unwrap_or(DEFAULT_MAX_FORWARDS),
        ));
        for route in self.routes() {
            cancel.headers.push(SipHeader::Route(route.clone()));
        }
        Ok(cancel)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self)?;
        let cseq = self.cseq()?;
        if cseq.method != self.method {
            return Err(Error::invalid_header(
                "CSeq",
                format!("method {} does not match request method {}", cseq.method, self.method),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!("{} {} SIP/2.0", self.method, self.uri);
        parser::serialize(&start_line, &self.headers, self.body.as_ref())
    }
}

impl HeaderAccess for Request {
    fn headers(&self) -> &[SipHeader] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<SipHeader> {
        &mut self.headers
    }

    fn body(&self) -> Option<&MsgBody> {
        self.body.as_ref()
    }

    fn body_mut(&mut self) -> Option<&mut MsgBody> {
        self.body.as_mut()
    }

    fn set_body(&mut self, body: Option<MsgBody>) {
        self.body = body;
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP response
#[derive(Debug, Clone)]
pub struct Response {
    pub scode: u16,
    pub reason: String,
    pub headers: Vec<SipHeader>,
    pub body: Option<MsgBody>,
    pub source: Option<HostPort>,
    pub rtime: Option<MonoTime>,
}

impl Response {
    pub fn new(scode: u16, reason: &str) -> Self {
        Self::from_parts(scode, reason.to_string(), Vec::new(), None)
    }

    pub fn from_parts(scode: u16, reason: String, headers: Vec<SipHeader>, body: Option<MsgBody>) -> Self {
        Response {
            scode,
            reason,
            headers,
            body,
            source: None,
            rtime: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Response> {
        match parser::parse_message(data)? {
            Message::Response(resp) => Ok(resp),
            Message::Request(_) => Err(Error::Parse("expected a response, got a request".to_string())),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.scode < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.scode)
    }

    pub fn is_final(&self) -> bool {
        self.scode >= 200
    }

    /// `"<scode> <reason>"`, used in events and logs
    pub fn status_line(&self) -> String {
        format!("{} {}", self.scode, self.reason)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self)
    }

    pub fn to_bytes(&self) -> Bytes {
        let start_line = format!("SIP/2.0 {} {}", self.scode, self.reason);
        parser::serialize(&start_line, &self.headers, self.body.as_ref())
    }
}

impl HeaderAccess for Response {
    fn headers(&self) -> &[SipHeader] {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<SipHeader> {
        &mut self.headers
    }

    fn body(&self) -> Option<&MsgBody> {
        self.body.as_ref()
    }

    fn body_mut(&mut self) -> Option<&mut MsgBody> {
        self.body.as_mut()
    }

    fn set_body(&mut self, body: Option<MsgBody>) {
        self.body = body;
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Either kind of message, as produced by the parser
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn parse(data: &[u8]) -> Result<Message> {
        parser::parse_message(data)
    }

    /// Responses are recognized by their first bytes alone
    pub fn is_response_data(data: &[u8]) -> bool {
        data.starts_with(parser::RESPONSE_PREFIX)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Message::Request(r) => r.validate(),
            Message::Response(r) => r.validate(),
        }
    }

    pub fn call_id(&self) -> Result<&str> {
        match self {
            Message::Request(r) => r.call_id(),
            Message::Response(r) => r.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Record-Route: <sip:p1.example.com;lr>\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn test_set_header_replaces_all() {
        let mut req = Request::parse(INVITE.as_bytes()).unwrap();
        req.append_header(SipHeader::MaxForwards(10));
        req.set_header(SipHeader::MaxForwards(5));
        assert_eq!(req.max_forwards(), Some(5));
        assert_eq!(req.headers.iter().filter(|h| h.is(&HeaderName::MaxForwards)).count(), 1);
        assert!(matches!(req.headers[1], SipHeader::MaxForwards(5)));
    }

    #[test]
    fn test_prepend_goes_before_same_name() {
        let mut req = Request::parse(INVITE.as_bytes()).unwrap();
        let via = Via::new_udp(&HostPort::new("10.0.0.1", 5060));
        req.prepend_header(SipHeader::Via(via.clone()));
        assert_eq!(req.top_via().unwrap(), &via);
        assert_eq!(req.vias().len(), 2);
    }

    #[test]
    fn test_gen_response_copies_record_route_only_for_dialog_responses() {
        let req = Request::parse(INVITE.as_bytes()).unwrap();
        assert_eq!(req.gen_response(180, "Ringing").record_routes().len(), 1);
        assert_eq!(req.gen_response(100, "Trying").record_routes().len(), 0);
        assert_eq!(req.gen_response(486, "Busy Here").record_routes().len(), 0);
        let ok = req.gen_response(200, "OK");
        assert_eq!(ok.call_id().unwrap(), "a84b4c76e66710@pc33.atlanta.com");
        assert!(ok.contact().is_none());
    }

    #[test]
    fn test_header_value_raw() {
        let req = Request::parse(INVITE.as_bytes()).unwrap();
        assert_eq!(req.header_value("cseq").as_deref(), Some("314159 INVITE"));
        assert!(req.header_value("X-Missing").is_none());
    }
}
