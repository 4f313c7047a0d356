//! Name-address values used by From, To, Contact, Route, Record-Route and
//! Refer-To:
//!
//! ```text
//! "Alice" <sip:alice@atlanta.com>;tag=1928301774
//! <sip:p1.example.com;lr>
//! sip:bob@biloxi.com;tag=a6c85cf
//! ```
//!
//! In the last (addr-spec) form, parameters after the URI belong to the
//! header, not the URI. Addresses always serialize in the bracketed form.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::{Error, Result};
use crate::types::param::Params;
use crate::types::uri::SipUri;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Params,
}

impl Address {
    pub fn new(uri: SipUri) -> Self {
        Address {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag));
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn remove_tag(&mut self) {
        self.params.remove("tag");
    }

    /// Random dialog tag
    pub fn gen_tag() -> String {
        format!("{:016x}", rand::thread_rng().r#gen::<u64>())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            if name.starts_with('"') {
                write!(f, "{} ", name)?;
            } else {
                write!(f, "\"{}\" ", name)?;
            }
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(lt) = find_unquoted(s, '<') {
            let gt = s[lt..]
                .find('>')
                .map(|i| i + lt)
                .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
            let display = s[..lt].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.trim_matches('"').to_string())
            };
            let uri = s[lt + 1..gt].parse::<SipUri>()?;
            let tail = s[gt + 1..].trim();
            let params = match tail.strip_prefix(';') {
                Some(p) => Params::parse(p),
                None if tail.is_empty() => Params::new(),
                None => return Err(Error::InvalidUri(s.to_string())),
            };
            return Ok(Address {
                display_name,
                uri,
                params,
            });
        }

        let (uri, params) = match s.split_once(';') {
            Some((u, p)) => (u, Params::parse(p)),
            None => (s, Params::new()),
        };
        Ok(Address {
            display_name: None,
            uri: uri.parse()?,
            params,
        })
    }
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_addr() {
        let addr: Address = "\"Alice <A>\" <sip:alice@atlanta.com>;tag=1928301774".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice <A>"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn test_addr_spec_params_belong_to_header() {
        let addr: Address = "sip:bob@biloxi.com;tag=a6c85cf".parse().unwrap();
        assert_eq!(addr.tag(), Some("a6c85cf"));
        assert!(addr.uri.params.is_empty());
        assert_eq!(addr.to_string(), "<sip:bob@biloxi.com>;tag=a6c85cf");
    }

    #[test]
    fn test_route_keeps_uri_params() {
        let addr: Address = "<sip:p1.example.com;lr>".parse().unwrap();
        assert!(addr.uri.lr());
        assert_eq!(addr.to_string(), "<sip:p1.example.com;lr>");
    }

    #[test]
    fn test_gen_tag_is_unique() {
        assert_ne!(Address::gen_tag(), Address::gen_tag());
    }
}
