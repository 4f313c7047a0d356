use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::method::Method;

/// `RAck: 776656 1 INVITE` (RFC 3262)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

impl FromStr for RAck {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::invalid_header("RAck", format!("expected 3 fields in '{}'", s)));
        }
        let num = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| Error::invalid_header("RAck", format!("bad number '{}'", v)))
        };
        Ok(RAck {
            rseq: num(parts[0])?,
            cseq: num(parts[1])?,
            method: parts[2].parse()?,
        })
    }
}
