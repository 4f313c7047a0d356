use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default SIP port for UDP
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Host name or IP literal plus port.
///
/// IPv6 hosts are stored without brackets and bracketed on display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        HostPort { host, port }
    }

    /// IP address when the host is an IP literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Socket address when the host is an IP literal; hostnames need resolving
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Split `host[:port]` or `[v6][:port]`
pub(crate) fn split_host_port(input: &str) -> Result<(String, Option<u16>)> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Parse("empty host".to_string()));
    }
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::Parse(format!("invalid port '{}'", p)))
    };
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Parse(format!("unterminated IPv6 reference '{}'", input)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(Error::Parse(format!("garbage after host '{}'", input))),
        };
        return Ok((host.to_string(), port));
    }
    match input.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no brackets
        Some((host, _)) if host.contains(':') => Ok((input.to_string(), None)),
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((input.to_string(), None)),
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        Ok(HostPort::new(host, port.unwrap_or(DEFAULT_SIP_PORT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("10.0.0.1:5070".parse::<HostPort>().unwrap(), HostPort::new("10.0.0.1", 5070));
        assert_eq!("example.com".parse::<HostPort>().unwrap(), HostPort::new("example.com", 5060));
        let v6 = "[2001:db8::1]:5062".parse::<HostPort>().unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:5062");
        assert!(v6.socket_addr().is_some());
    }

    #[test]
    fn test_hostname_has_no_socket_addr() {
        assert!(HostPort::new("proxy.example.com", 5060).socket_addr().is_none());
    }
}
