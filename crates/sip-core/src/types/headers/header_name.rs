use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SIP header names the stack understands.
///
/// Header names are case-insensitive in SIP; parsing also accepts the
/// RFC 3261 compact forms (`f`, `t`, `v`, `l`, `c`, `m`, `i`, `k`) and
/// `r` for Refer-To (RFC 3515). Anything else is kept verbatim in `Other`.
///
/// ```rust
/// use b2bua_sip_core::HeaderName;
/// use std::str::FromStr;
///
/// assert_eq!(HeaderName::from_str("f").unwrap(), HeaderName::From);
/// assert_eq!(HeaderName::from_str("call-id").unwrap(), HeaderName::CallId);
/// assert_eq!(HeaderName::From.as_str(), "From");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    Route,
    RecordRoute,
    MaxForwards,
    ContentType,
    ContentLength,
    Expires,
    Reason,
    RSeq,
    RAck,
    Supported,
    Require,
    ReferTo,
    WwwAuthenticate,
    ProxyAuthenticate,
    Authorization,
    ProxyAuthorization,
    UserAgent,
    Server,
    Other(String),
}

impl HeaderName {
    /// Canonical spelling
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Expires => "Expires",
            HeaderName::Reason => "Reason",
            HeaderName::RSeq => "RSeq",
            HeaderName::RAck => "RAck",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Server => "Server",
            HeaderName::Other(name) => name,
        }
    }

    /// Compact form, where one is defined
    pub fn compact_form(&self) -> Option<&'static str> {
        match self {
            HeaderName::From => Some("f"),
            HeaderName::To => Some("t"),
            HeaderName::Via => Some("v"),
            HeaderName::ContentLength => Some("l"),
            HeaderName::ContentType => Some("c"),
            HeaderName::Contact => Some("m"),
            HeaderName::CallId => Some("i"),
            HeaderName::Supported => Some("k"),
            HeaderName::ReferTo => Some("r"),
            _ => None,
        }
    }

    /// Whether a single header line may carry a comma-separated list
    pub fn is_multi_valued(&self) -> bool {
        matches!(
            self,
            HeaderName::Via
                | HeaderName::Contact
                | HeaderName::Route
                | HeaderName::RecordRoute
                | HeaderName::Supported
                | HeaderName::Require
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(Error::Parse(format!("invalid header name '{}'", s)));
        }
        let name = match s.to_ascii_lowercase().as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "max-forwards" => HeaderName::MaxForwards,
            "content-type" | "c" => HeaderName::ContentType,
            "content-length" | "l" => HeaderName::ContentLength,
            "expires" => HeaderName::Expires,
            "reason" => HeaderName::Reason,
            "rseq" => HeaderName::RSeq,
            "rack" => HeaderName::RAck,
            "supported" | "k" => HeaderName::Supported,
            "require" => HeaderName::Require,
            "refer-to" | "r" => HeaderName::ReferTo,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "authorization" => HeaderName::Authorization,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "user-agent" => HeaderName::UserAgent,
            "server" => HeaderName::Server,
            _ => HeaderName::Other(s.to_string()),
        };
        Ok(name)
    }
}
