use std::fmt;

use crate::error::{Error, Result};
use crate::types::address::Address;
use crate::types::auth::Challenge;
use crate::types::cseq::CSeq;
use crate::types::headers::header_name::HeaderName;
use crate::types::param::split_outside_quotes;
use crate::types::rack::RAck;
use crate::types::reason::Reason;
use crate::types::via::Via;

/// A parsed SIP header.
///
/// The set is closed: headers the stack does not interpret are carried in
/// [`SipHeader::Other`] and re-serialized verbatim. `Content-Type` and
/// `Content-Length` never appear here; they are derived from the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipHeader {
    Via(Via),
    From(Address),
    To(Address),
    CallId(String),
    CSeq(CSeq),
    Contact(Address),
    Route(Address),
    RecordRoute(Address),
    MaxForwards(u32),
    Expires(u32),
    Reason(Reason),
    RSeq(u32),
    RAck(RAck),
    Supported(String),
    Require(String),
    ReferTo(Address),
    WwwAuthenticate(Challenge),
    ProxyAuthenticate(Challenge),
    Authorization(String),
    ProxyAuthorization(String),
    UserAgent(String),
    Server(String),
    Other { name: String, value: String },
}

impl SipHeader {
    pub fn name(&self) -> HeaderName {
        match self {
            SipHeader::Via(_) => HeaderName::Via,
            SipHeader::From(_) => HeaderName::From,
            SipHeader::To(_) => HeaderName::To,
            SipHeader::CallId(_) => HeaderName::CallId,
            SipHeader::CSeq(_) => HeaderName::CSeq,
            SipHeader::Contact(_) => HeaderName::Contact,
            SipHeader::Route(_) => HeaderName::Route,
            SipHeader::RecordRoute(_) => HeaderName::RecordRoute,
            SipHeader::MaxForwards(_) => HeaderName::MaxForwards,
            SipHeader::Expires(_) => HeaderName::Expires,
            SipHeader::Reason(_) => HeaderName::Reason,
            SipHeader::RSeq(_) => HeaderName::RSeq,
            SipHeader::RAck(_) => HeaderName::RAck,
            SipHeader::Supported(_) => HeaderName::Supported,
            SipHeader::Require(_) => HeaderName::Require,
            SipHeader::ReferTo(_) => HeaderName::ReferTo,
            SipHeader::WwwAuthenticate(_) => HeaderName::WwwAuthenticate,
            SipHeader::ProxyAuthenticate(_) => HeaderName::ProxyAuthenticate,
            SipHeader::Authorization(_) => HeaderName::Authorization,
            SipHeader::ProxyAuthorization(_) => HeaderName::ProxyAuthorization,
            SipHeader::UserAgent(_) => HeaderName::UserAgent,
            SipHeader::Server(_) => HeaderName::Server,
            SipHeader::Other { name, .. } => HeaderName::Other(name.clone()),
        }
    }

    /// Case-insensitive name comparison
    pub fn is(&self, name: &HeaderName) -> bool {
        self.name().as_str().eq_ignore_ascii_case(name.as_str())
    }

    /// Custom header
    pub fn other(name: impl Into<String>, value: impl Into<String>) -> Self {
        SipHeader::Other {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse one header line's value. List-valued headers yield one entry per
    /// element.
    pub fn parse(name: &str, value: &str) -> Result<Vec<SipHeader>> {
        let header_name: HeaderName = name.parse()?;
        let value = value.trim();

        if header_name.is_multi_valued() {
            // `Contact: *` in REGISTER is not an address
            if header_name == HeaderName::Contact && value == "*" {
                return Ok(vec![SipHeader::other("Contact", "*")]);
            }
            return split_outside_quotes(value, ',')
                .into_iter()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| Self::parse_single(&header_name, v))
                .collect();
        }
        Ok(vec![Self::parse_single(&header_name, value)?])
    }

    fn parse_single(name: &HeaderName, value: &str) -> Result<SipHeader> {
        let number = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::invalid_header(name.as_str(), format!("not a number: '{}'", v)))
        };
        let header = match name {
            HeaderName::Via => SipHeader::Via(value.parse()?),
            HeaderName::From => SipHeader::From(value.parse()?),
            HeaderName::To => SipHeader::To(value.parse()?),
            HeaderName::CallId => {
                if value.is_empty() {
                    return Err(Error::invalid_header("Call-ID", "empty"));
                }
                SipHeader::CallId(value.to_string())
            }
            HeaderName::CSeq => SipHeader::CSeq(value.parse()?),
            HeaderName::Contact => SipHeader::Contact(value.parse()?),
            HeaderName::Route => SipHeader::Route(value.parse()?),
            HeaderName::RecordRoute => SipHeader::RecordRoute(value.parse()?),
            HeaderName::MaxForwards => SipHeader::MaxForwards(number(value)?),
            HeaderName::Expires => SipHeader::Expires(number(value)?),
            HeaderName::Reason => SipHeader::Reason(value.parse()?),
            HeaderName::RSeq => SipHeader::RSeq(number(value)?),
            HeaderName::RAck => SipHeader::RAck(value.parse()?),
            HeaderName::Supported => SipHeader::Supported(value.to_string()),
            HeaderName::Require => SipHeader::Require(value.to_string()),
            HeaderName::ReferTo => SipHeader::ReferTo(value.parse()?),
            HeaderName::WwwAuthenticate => SipHeader::WwwAuthenticate(value.parse()?),
            HeaderName::ProxyAuthenticate => SipHeader::ProxyAuthenticate(value.parse()?),
            HeaderName::Authorization => SipHeader::Authorization(value.to_string()),
            HeaderName::ProxyAuthorization => SipHeader::ProxyAuthorization(value.to_string()),
            HeaderName::UserAgent => SipHeader::UserAgent(value.to_string()),
            HeaderName::Server => SipHeader::Server(value.to_string()),
            HeaderName::ContentType | HeaderName::ContentLength => {
                return Err(Error::invalid_header(name.as_str(), "body headers are not stored"));
            }
            HeaderName::Other(n) => SipHeader::other(n.clone(), value),
        };
        Ok(header)
    }

    fn value_string(&self) -> String {
        match self {
            SipHeader::Via(v) => v.to_string(),
            SipHeader::From(a)
            | SipHeader::To(a)
            | SipHeader::Contact(a)
            | SipHeader::Route(a)
            | SipHeader::RecordRoute(a)
            | SipHeader::ReferTo(a) => a.to_string(),
            SipHeader::CallId(s)
            | SipHeader::Supported(s)
            | SipHeader::Require(s)
            | SipHeader::Authorization(s)
            | SipHeader::ProxyAuthorization(s)
            | SipHeader::UserAgent(s)
            | SipHeader::Server(s) => s.clone(),
            SipHeader::CSeq(c) => c.to_string(),
            SipHeader::MaxForwards(n) | SipHeader::Expires(n) | SipHeader::RSeq(n) => n.to_string(),
            SipHeader::Reason(r) => r.to_string(),
            SipHeader::RAck(r) => r.to_string(),
            SipHeader::WwwAuthenticate(c) | SipHeader::ProxyAuthenticate(c) => c.to_string(),
            SipHeader::Other { value, .. } => value.clone(),
        }
    }
}

impl fmt::Display for SipHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.value_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_forms() {
        let h = SipHeader::parse("f", "<sip:a@b>;tag=1").unwrap();
        assert!(matches!(&h[0], SipHeader::From(a) if a.tag() == Some("1")));
        let h = SipHeader::parse("i", "abc@host").unwrap();
        assert_eq!(h[0], SipHeader::CallId("abc@host".to_string()));
        let h = SipHeader::parse("m", "<sip:bob@10.0.0.2>").unwrap();
        assert!(matches!(&h[0], SipHeader::Contact(_)));
    }

    #[test]
    fn test_list_valued_split() {
        let h = SipHeader::parse("Record-Route", "<sip:p2.example.com;lr>, <sip:p1.example.com;lr>").unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[1].to_string(), "Record-Route: <sip:p1.example.com;lr>");
    }

    #[test]
    fn test_unknown_header_is_kept() {
        let h = SipHeader::parse("X-Custom", "  some value ").unwrap();
        assert_eq!(h[0].to_string(), "X-Custom: some value");
        assert!(h[0].is(&HeaderName::Other("x-custom".to_string())));
    }

    #[test]
    fn test_bad_numeric_value() {
        assert!(SipHeader::parse("Max-Forwards", "seventy").is_err());
    }
}
