use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::method::Method;

/// `CSeq: 314159 INVITE`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::invalid_header("CSeq", format!("bad sequence number in '{}'", s)))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::invalid_header("CSeq", "missing method"))?
            .parse()?;
        if parts.next().is_some() {
            return Err(Error::invalid_header("CSeq", format!("trailing data in '{}'", s)));
        }
        Ok(CSeq { seq, method })
    }
}
