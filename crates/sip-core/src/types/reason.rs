use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::param::Params;

/// `Reason: SIP;cause=200;text="Call completed elsewhere"` (RFC 3326)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub protocol: String,
    pub cause: u16,
    pub text: Option<String>,
}

impl Reason {
    pub fn new(protocol: impl Into<String>, cause: u16, text: Option<&str>) -> Self {
        Reason {
            protocol: protocol.into(),
            cause,
            text: text.map(str::to_string),
        }
    }

    /// SIP-protocol reason
    pub fn sip(cause: u16, text: &str) -> Self {
        Self::new("SIP", cause, Some(text))
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};cause={}", self.protocol, self.cause)?;
        if let Some(text) = &self.text {
            write!(f, ";text=\"{}\"", text)?;
        }
        Ok(())
    }
}

impl FromStr for Reason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, params) = match s.split_once(';') {
            Some((p, rest)) => (p.trim(), Params::parse(rest)),
            None => (s.trim(), Params::new()),
        };
        let cause = params
            .value("cause")
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::invalid_header("Reason", format!("missing cause in '{}'", s)))?;
        Ok(Reason {
            protocol: protocol.to_string(),
            cause,
            text: params.value("text").map(|t| t.trim_matches('"').to_string()),
        })
    }
}
