//! Authentication challenges (`WWW-Authenticate`, `Proxy-Authenticate`).
//!
//! Only the parameter list is modelled; computing credentials is the UA's job.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::param::split_outside_quotes;

/// `Digest realm="atlanta.com", nonce="84a4cc6f", qop="auth", algorithm=MD5`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    /// Parameter value with surrounding quotes removed
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim_matches('"'))
    }

    pub fn is_digest(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Digest")
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    pub fn nonce(&self) -> Option<&str> {
        self.param("nonce")
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme)?;
        for (idx, (name, value)) in self.params.iter().enumerate() {
            let sep = if idx == 0 { " " } else { ", " };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

impl FromStr for Challenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        if scheme.is_empty() {
            return Err(Error::invalid_header("WWW-Authenticate", "empty challenge"));
        }
        let mut params = Vec::new();
        for item in split_outside_quotes(rest, ',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (name, value) = item.split_once('=').ok_or_else(|| {
                Error::invalid_header("WWW-Authenticate", format!("bad parameter '{}'", item))
            })?;
            params.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(Challenge {
            scheme: scheme.to_string(),
            params,
        })
    }
}
