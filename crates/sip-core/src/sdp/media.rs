use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::sdp::session::{SdpConnection, SdpLine};

/// `m=<media> <port>[/<count>] <proto> <fmt> ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub transport: String,
    pub formats: Vec<String>,
}

impl fmt::Display for SdpMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.media_type, self.port)?;
        if let Some(count) = self.port_count {
            write!(f, "/{}", count)?;
        }
        write!(f, " {}", self.transport)?;
        for format in &self.formats {
            write!(f, " {}", format)?;
        }
        Ok(())
    }
}

impl FromStr for SdpMedia {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let f: Vec<&str> = s.split_whitespace().collect();
        if f.len() < 3 {
            return Err(Error::Sdp(format!("m= needs at least 3 fields: '{}'", s)));
        }
        let (port, port_count) = match f[1].split_once('/') {
            Some((p, n)) => (p, Some(n)),
            None => (f[1], None),
        };
        let bad_port = || Error::Sdp(format!("bad media port '{}'", f[1]));
        Ok(SdpMedia {
            media_type: f[0].to_string(),
            port: port.parse().map_err(|_| bad_port())?,
            port_count: match port_count {
                Some(n) => Some(n.parse().map_err(|_| bad_port())?),
                None => None,
            },
            transport: f[2].to_string(),
            formats: f[3..].iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// A media description and the lines that follow its `m=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMediaSection {
    pub media: SdpMedia,
    pub lines: Vec<SdpLine>,
}

impl SdpMediaSection {
    pub fn new(media: SdpMedia) -> Self {
        SdpMediaSection {
            media,
            lines: Vec::new(),
        }
    }

    pub fn connection(&self) -> Option<&SdpConnection> {
        self.lines.iter().find_map(|l| match l {
            SdpLine::Connection(c) => Some(c),
            _ => None,
        })
    }

    /// Rewrite the section's `c=` line, adding one if missing
    pub fn set_connection_address(&mut self, address: &str) {
        let mut found = false;
        for line in &mut self.lines {
            if let SdpLine::Connection(c) = line {
                c.set_address(address);
                found = true;
            }
        }
        if !found {
            self.lines.insert(0, SdpLine::Connection(SdpConnection::new(address)));
        }
    }

    pub fn port(&self) -> u16 {
        self.media.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.media.port = port;
    }

    /// Payload formats in preference order
    pub fn codecs(&self) -> &[String] {
        &self.media.formats
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            SdpLine::Attribute(a) => Some(a.as_str()),
            _ => None,
        })
    }

    /// Value of `a=<name>:<value>`, or `Some("")` for a flag attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes().find_map(|a| match a.split_once(':') {
            Some((n, v)) if n == name => Some(v),
            None if a == name => Some(""),
            _ => None,
        })
    }

    pub fn add_attribute(&mut self, attribute: &str) {
        self.lines.push(SdpLine::Attribute(attribute.to_string()));
    }

    pub fn remove_attributes(&mut self, name: &str) {
        self.lines.retain(|l| match l {
            SdpLine::Attribute(a) => a.split(':').next() != Some(name),
            _ => true,
        });
    }
}

impl fmt::Display for SdpMediaSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={}\r\n", self.media)?;
        for line in &self.lines {
            write!(f, "{}\r\n", line)?;
        }
        Ok(())
    }
}
