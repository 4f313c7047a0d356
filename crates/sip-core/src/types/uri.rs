//! # SIP URIs
//!
//! `sip:` / `sips:` URIs are split into user info, host, port, parameters and
//! headers:
//!
//! ```text
//! sip:alice:secret@atlanta.com:5060;transport=udp;lr?subject=project
//! ```
//!
//! Other schemes (`tel:`, ...) keep everything after the scheme in `host`
//! with any `;params` split off, which is enough for routing decisions that
//! never look inside them.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::host::{split_host_port, HostPort, DEFAULT_SIP_PORT};
use crate::types::param::Params;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Option<String>,
}

impl SipUri {
    /// Plain `sip:` URI
    pub fn new(user: Option<&str>, host: impl Into<String>, port: Option<u16>) -> Self {
        SipUri {
            scheme: "sip".to_string(),
            user: user.map(str::to_string),
            password: None,
            host: host.into(),
            port,
            params: Params::new(),
            headers: None,
        }
    }

    /// `sip:` URI pointing at `hostport`
    pub fn from_host_port(user: Option<&str>, hostport: &HostPort) -> Self {
        Self::new(user, hostport.host.clone(), Some(hostport.port))
    }

    pub fn is_sip(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sip") || self.scheme.eq_ignore_ascii_case("sips")
    }

    /// Loose-routing flag
    pub fn lr(&self) -> bool {
        self.params.contains("lr")
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Transport address this URI resolves to, `maddr` taking precedence
    pub fn host_port(&self) -> HostPort {
        let host = self.params.value("maddr").unwrap_or(&self.host);
        HostPort::new(host, self.port.unwrap_or(DEFAULT_SIP_PORT))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }
        if self.is_sip() && self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
            return Err(Error::InvalidUri(s.to_string()));
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (rest, None),
        };

        let is_sip = scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips");
        if !is_sip {
            let (body, params) = match rest.split_once(';') {
                Some((b, p)) => (b, Params::parse(p)),
                None => (rest, Params::new()),
            };
            return Ok(SipUri {
                scheme: scheme.to_string(),
                user: None,
                password: None,
                host: body.to_string(),
                port: None,
                params,
                headers,
            });
        }

        let (userinfo, hostpart) = match rest.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, rest),
        };
        let (user, password) = match userinfo {
            Some(u) => match u.split_once(':') {
                Some((user, pw)) => (Some(user.to_string()), Some(pw.to_string())),
                None => (Some(u.to_string()), None),
            },
            None => (None, None),
        };
        let (hostport, params) = match hostpart.split_once(';') {
            Some((h, p)) => (h, Params::parse(p)),
            None => (hostpart, Params::new()),
        };
        let (host, port) = split_host_port(hostport).map_err(|_| Error::InvalidUri(s.to_string()))?;
        if host.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
            return Err(Error::InvalidUri(s.to_string()));
        }

        Ok(SipUri {
            scheme: scheme.to_lowercase(),
            user,
            password,
            host,
            port,
            params,
            headers,
        })
    }
}
