use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::sdp::media::{SdpMedia, SdpMediaSection};

/// `o=<username> <sess-id> <sess-version> <nettype> <addrtype> <address>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl SdpOrigin {
    /// Fresh origin for a locally generated description
    pub fn new(username: &str, address: &str) -> Self {
        let id = rand::random::<u32>() as u64;
        SdpOrigin {
            username: username.to_string(),
            session_id: id.to_string(),
            version: id,
            net_type: "IN".to_string(),
            addr_type: addr_type_for(address).to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for SdpOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username, self.session_id, self.version, self.net_type, self.addr_type, self.address
        )
    }
}

impl FromStr for SdpOrigin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let f: Vec<&str> = s.split_whitespace().collect();
        if f.len() != 6 {
            return Err(Error::Sdp(format!("o= needs 6 fields: '{}'", s)));
        }
        Ok(SdpOrigin {
            username: f[0].to_string(),
            session_id: f[1].to_string(),
            version: f[2]
                .parse()
                .map_err(|_| Error::Sdp(format!("bad session version '{}'", f[2])))?,
            net_type: f[3].to_string(),
            addr_type: f[4].to_string(),
            address: f[5].to_string(),
        })
    }
}

/// `c=<nettype> <addrtype> <connection-address>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl SdpConnection {
    pub fn new(address: &str) -> Self {
        SdpConnection {
            net_type: "IN".to_string(),
            addr_type: addr_type_for(address).to_string(),
            address: address.to_string(),
        }
    }

    /// `0.0.0.0` (or `::`): the RFC 2543 way of putting media on hold
    pub fn is_null(&self) -> bool {
        self.address == "0.0.0.0" || self.address == "::"
    }

    pub fn set_address(&mut self, address: &str) {
        self.addr_type = addr_type_for(address).to_string();
        self.address = address.to_string();
    }
}

impl fmt::Display for SdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.net_type, self.addr_type, self.address)
    }
}

impl FromStr for SdpConnection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let f: Vec<&str> = s.split_whitespace().collect();
        if f.len() != 3 {
            return Err(Error::Sdp(format!("c= needs 3 fields: '{}'", s)));
        }
        Ok(SdpConnection {
            net_type: f[0].to_string(),
            addr_type: f[1].to_string(),
            address: f[2].to_string(),
        })
    }
}

fn addr_type_for(address: &str) -> &'static str {
    if address.contains(':') { "IP6" } else { "IP4" }
}

/// One `x=value` line, with the lines the stack edits parsed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpLine {
    Origin(SdpOrigin),
    Connection(SdpConnection),
    Attribute(String),
    Other(char, String),
}

impl SdpLine {
    pub(crate) fn parse(line: &str) -> Result<SdpLine> {
        let mut chars = line.chars();
        let kind = chars.next().ok_or_else(|| Error::Sdp("empty line".to_string()))?;
        if chars.next() != Some('=') || !kind.is_ascii_lowercase() {
            return Err(Error::Sdp(format!("malformed line '{}'", line)));
        }
        let value = &line[2..];
        Ok(match kind {
            'o' => SdpLine::Origin(value.parse()?),
            'c' => SdpLine::Connection(value.parse()?),
            'a' => SdpLine::Attribute(value.to_string()),
            k => SdpLine::Other(k, value.to_string()),
        })
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpLine::Origin(o) => write!(f, "o={}", o),
            SdpLine::Connection(c) => write!(f, "c={}", c),
            SdpLine::Attribute(a) => write!(f, "a={}", a),
            SdpLine::Other(k, v) => write!(f, "{}={}", k, v),
        }
    }
}

/// Session description: session-level lines followed by media sections.
///
/// Line order is preserved so a rewritten body differs from the received one
/// only where it was edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpBody {
    pub lines: Vec<SdpLine>,
    pub sections: Vec<SdpMediaSection>,
}

impl SdpBody {
    pub fn origin(&self) -> Option<&SdpOrigin> {
        self.lines.iter().find_map(|l| match l {
            SdpLine::Origin(o) => Some(o),
            _ => None,
        })
    }

    pub fn origin_mut(&mut self) -> Option<&mut SdpOrigin> {
        self.lines.iter_mut().find_map(|l| match l {
            SdpLine::Origin(o) => Some(o),
            _ => None,
        })
    }

    pub fn set_origin(&mut self, origin: SdpOrigin) {
        match self.origin_mut() {
            Some(o) => *o = origin,
            None => {
                let at = usize::from(matches!(self.lines.first(), Some(SdpLine::Other('v', _))));
                self.lines.insert(at, SdpLine::Origin(origin));
            }
        }
    }

    /// Session-level connection
    pub fn connection(&self) -> Option<&SdpConnection> {
        self.lines.iter().find_map(|l| match l {
            SdpLine::Connection(c) => Some(c),
            _ => None,
        })
    }

    /// Connection in effect for `section`: its own, else the session one
    pub fn effective_connection<'a>(&'a self, section: &'a SdpMediaSection) -> Option<&'a SdpConnection> {
        section.connection().or_else(|| self.connection())
    }

    /// Point every connection line at `address`
    pub fn set_connection_address(&mut self, address: &str) {
        let mut session_level = false;
        for line in &mut self.lines {
            if let SdpLine::Connection(c) = line {
                c.set_address(address);
                session_level = true;
            }
        }
        for section in &mut self.sections {
            if section.connection().is_some() || !session_level {
                section.set_connection_address(address);
            }
        }
    }

    /// Put all media on hold by zeroing connection addresses
    pub fn hold(&mut self) {
        self.set_connection_address("0.0.0.0");
    }

    pub fn is_on_hold(&self) -> bool {
        !self.sections.is_empty()
            && self
                .sections
                .iter()
                .all(|s| self.effective_connection(s).map(SdpConnection::is_null).unwrap_or(false))
    }

    /// First section of the given media type, e.g. `audio`
    pub fn first_section(&self, media_type: &str) -> Option<&SdpMediaSection> {
        self.sections.iter().find(|s| s.media.media_type == media_type)
    }
}

impl FromStr for SdpBody {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut sections: Vec<SdpMediaSection> = Vec::new();
        for raw in s.lines() {
            let raw = raw.trim_end_matches('\r');
            if raw.trim().is_empty() {
                continue;
            }
            if let Some(m) = raw.strip_prefix("m=") {
                sections.push(SdpMediaSection::new(m.parse::<SdpMedia>()?));
                continue;
            }
            let line = SdpLine::parse(raw)?;
            match sections.last_mut() {
                Some(section) => section.lines.push(line),
                None => lines.push(line),
            }
        }
        if !matches!(lines.first(), Some(SdpLine::Other('v', _))) {
            return Err(Error::Sdp("description must start with v=".to_string()));
        }
        Ok(SdpBody { lines, sections })
    }
}

impl fmt::Display for SdpBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            write!(f, "{}\r\n", line)?;
        }
        for section in &self.sections {
            write!(f, "{}", section)?;
        }
        Ok(())
    }
}
