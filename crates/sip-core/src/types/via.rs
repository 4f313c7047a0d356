//! # Via
//!
//! Each hop a request traverses pushes a Via; responses travel back by
//! popping them. The topmost Via's `branch` identifies the client
//! transaction (RFC 3261 §8.1.1.7, magic cookie `z9hG4bK`), and its
//! `received` / `rport` parameters (RFC 3581) tell the server where the
//! request really came from.

use std::fmt;
use std::str::FromStr;

use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{char, space0, space1};
use nom::sequence::tuple;
use nom::IResult;

use crate::error::{Error, Result};
use crate::types::host::{split_host_port, HostPort, DEFAULT_SIP_PORT};
use crate::types::param::Params;

/// RFC 3261 branch magic cookie
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    /// UDP Via for `sent_by` with a fresh branch and an empty `rport`
    pub fn new_udp(sent_by: &HostPort) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(&Self::gen_branch()));
        params.set("rport", None);
        Via {
            transport: "UDP".to_string(),
            host: sent_by.host.clone(),
            port: Some(sent_by.port),
            params,
        }
    }

    pub fn gen_branch() -> String {
        format!("{}{}", BRANCH_MAGIC_COOKIE, uuid::Uuid::new_v4().simple())
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: &str) {
        self.params.set("branch", Some(branch));
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    /// `None` when absent, `Some(None)` when present without a value
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params
            .get("rport")
            .map(|v| v.and_then(|p| p.parse().ok()))
    }

    pub fn sent_by(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port.unwrap_or(DEFAULT_SIP_PORT))
    }

    /// Where responses for this hop go (RFC 3261 §18.2.2, RFC 3581 §4)
    pub fn response_target(&self) -> HostPort {
        let host = self.received().unwrap_or(&self.host);
        let port = match self.rport() {
            Some(Some(port)) => port,
            _ => self.port.unwrap_or(DEFAULT_SIP_PORT),
        };
        HostPort::new(host, port)
    }

    /// Record the packet's real source on a received request
    pub fn fix_received(&mut self, source: &HostPort) {
        if self.host != source.host {
            self.params.set("received", Some(&source.host));
        }
        if self.params.contains("rport") {
            self.params.set("rport", Some(&source.port.to_string()));
            self.params.set("received", Some(&source.host));
        }
    }
}

fn sent_protocol(input: &str) -> IResult<&str, &str> {
    let (input, (_, _, _, _, _, _, _, _, transport, _)) = tuple((
        tag_no_case("SIP"),
        space0,
        char('/'),
        space0,
        tag("2.0"),
        space0,
        char('/'),
        space0,
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        space1,
    ))(input)?;
    Ok((input, transport))
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (rest, transport) = sent_protocol(s.trim())
            .map_err(|e| Error::invalid_header("Via", format!("bad sent-protocol: {}", e)))?;
        let (sent_by, params) = match rest.split_once(';') {
            Some((h, p)) => (h, Params::parse(p)),
            None => (rest, Params::new()),
        };
        let (host, port) =
            split_host_port(sent_by).map_err(|e| Error::invalid_header("Via", e.to_string()))?;
        Ok(Via {
            transport: transport.to_uppercase(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}
