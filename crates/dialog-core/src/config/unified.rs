//! Unified configuration for the transaction layer, transport and user agents
//!
//! ```rust
//! use std::time::Duration;
//! use b2bua_dialog_core::config::{DialogCoreConfig, UaConfig};
//!
//! let config = DialogCoreConfig::default()
//!     .with_ua(
//!         UaConfig::default()
//!             .with_credit_time(Duration::from_secs(3600))
//!             .with_100rel(true),
//!     );
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use b2bua_sip_core::{HostPort, SipUri};
use b2bua_sip_transport::UdpServerConfig;
use serde::{Deserialize, Serialize};

use crate::config::timers::TimerSettings;
use crate::errors::{DialogError, DialogResult};

/// Product token used in User-Agent and Server headers
pub const DEFAULT_USER_AGENT: &str = concat!("b2bua-rs/", env!("CARGO_PKG_VERSION"));

/// Transaction manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub timers: TimerSettings,
    /// Resend the last provisional response on this interval until a final
    /// one is sent. For peers behind lossy paths that need it.
    pub provisional_retransmit: Option<Duration>,
    /// Lifetime of one response cache generation
    pub cache_rotate_interval: Duration,
    /// Drop the first N transmissions of every cached response (testing aid)
    pub loss_emulation: u32,
    /// `Server` header on responses generated by the transaction layer
    pub server_header: Option<String>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            timers: TimerSettings::default(),
            provisional_retransmit: None,
            cache_rotate_interval: Duration::from_secs(32),
            loss_emulation: 0,
            server_header: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

impl TransactionConfig {
    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_provisional_retransmit(mut self, interval: Duration) -> Self {
        self.provisional_retransmit = Some(interval);
        self
    }

    pub fn with_loss_emulation(mut self, count: u32) -> Self {
        self.loss_emulation = count;
        self
    }

    pub fn validate(&self) -> DialogResult<()> {
        let t = &self.timers;
        if t.t1.is_zero() {
            return Err(DialogError::config("T1 must be positive"));
        }
        if t.t2 < t.t1 {
            return Err(DialogError::config("T2 must not be shorter than T1"));
        }
        if self.cache_rotate_interval.is_zero() {
            return Err(DialogError::config("cache rotate interval must be positive"));
        }
        if let Some(interval) = self.provisional_retransmit {
            if interval.is_zero() {
                return Err(DialogError::config("provisional retransmit interval must be positive"));
            }
        }
        Ok(())
    }
}

/// Digest credentials for challenged outgoing INVITEs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Per call-leg settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UaConfig {
    pub user_agent: String,
    /// Time spent in Disconnected or Failed before the leg is destroyed
    pub godead_timeout: Duration,
    /// Give up an outgoing call not answered within this time
    pub expire_time: Option<Duration>,
    /// Give up an outgoing call with no ringing within this time
    pub no_progress_time: Option<Duration>,
    /// Give up an outgoing call with no response at all within this time
    pub no_reply_time: Option<Duration>,
    /// Maximum connected duration
    pub credit_time: Option<Duration>,
    /// In-dialog OPTIONS interval while connected
    pub keepalive_interval: Option<Duration>,
    /// Send offer-less INVITEs and hold the 2xx ACK until the answer is known
    pub late_media: bool,
    /// RFC 3262 reliable provisional responses
    pub enable_100rel: bool,
    pub outbound_proxy: Option<HostPort>,
    pub credentials: Option<Credentials>,
    /// Trust the packet source over Contact for the remote target
    pub nat_traversal: bool,
    /// Contact to advertise instead of the transport's local address
    #[serde(skip)]
    pub local_contact: Option<SipUri>,
}

impl Default for UaConfig {
    fn default() -> Self {
        UaConfig {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            godead_timeout: Duration::from_secs(32),
            expire_time: None,
            no_progress_time: None,
            no_reply_time: None,
            credit_time: None,
            keepalive_interval: None,
            late_media: false,
            enable_100rel: false,
            outbound_proxy: None,
            credentials: None,
            nat_traversal: false,
            local_contact: None,
        }
    }
}

impl UaConfig {
    pub fn with_godead_timeout(mut self, timeout: Duration) -> Self {
        self.godead_timeout = timeout;
        self
    }

    pub fn with_expire_time(mut self, time: Duration) -> Self {
        self.expire_time = Some(time);
        self
    }

    pub fn with_no_progress_time(mut self, time: Duration) -> Self {
        self.no_progress_time = Some(time);
        self
    }

    pub fn with_no_reply_time(mut self, time: Duration) -> Self {
        self.no_reply_time = Some(time);
        self
    }

    pub fn with_credit_time(mut self, time: Duration) -> Self {
        self.credit_time = Some(time);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn with_late_media(mut self, late_media: bool) -> Self {
        self.late_media = late_media;
        self
    }

    pub fn with_100rel(mut self, enabled: bool) -> Self {
        self.enable_100rel = enabled;
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: HostPort) -> Self {
        self.outbound_proxy = Some(proxy);
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_nat_traversal(mut self, enabled: bool) -> Self {
        self.nat_traversal = enabled;
        self
    }

    pub fn with_local_contact(mut self, contact: SipUri) -> Self {
        self.local_contact = Some(contact);
        self
    }

    pub fn validate(&self) -> DialogResult<()> {
        if self.godead_timeout.is_zero() {
            return Err(DialogError::config("godead timeout must be positive"));
        }
        for (name, value) in [
            ("expire time", self.expire_time),
            ("no-progress time", self.no_progress_time),
            ("no-reply time", self.no_reply_time),
            ("credit time", self.credit_time),
            ("keepalive interval", self.keepalive_interval),
        ] {
            if value.map(|v| v.is_zero()).unwrap_or(false) {
                return Err(DialogError::config(format!("{} must be positive when set", name)));
            }
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(DialogError::config("credentials need a username"));
            }
        }
        Ok(())
    }
}

/// Everything needed to stand up a transaction manager with its transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogCoreConfig {
    pub transaction: TransactionConfig,
    pub transport: UdpServerConfig,
    pub ua: UaConfig,
}

impl DialogCoreConfig {
    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn with_transport(mut self, transport: UdpServerConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_ua(mut self, ua: UaConfig) -> Self {
        self.ua = ua;
        self
    }

    pub fn validate(&self) -> DialogResult<()> {
        self.transaction.validate()?;
        self.ua.validate()?;
        let t = &self.transport;
        if t.nreaders == 0 || t.nsenders == 0 || t.nresolvers == 0 {
            return Err(DialogError::config("transport needs at least one worker of each kind"));
        }
        if t.bind_address.ip().is_none() {
            return Err(DialogError::config(format!(
                "bind address must be an IP literal, got '{}'",
                t.bind_address.host
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        DialogCoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_timers() {
        let mut tc = TransactionConfig::default();
        tc.timers.t2 = Duration::from_millis(100);
        assert!(tc.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_optional_timer() {
        let ua = UaConfig::default().with_credit_time(Duration::ZERO);
        assert!(matches!(ua.validate(), Err(DialogError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_host_name_bind_address() {
        let config = DialogCoreConfig::default()
            .with_transport(UdpServerConfig::new(HostPort::new("sip.example.com", 5060)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_settings() {
        let config = DialogCoreConfig::default().with_ua(UaConfig::default().with_late_media(true));
        let json = serde_json::to_string(&config).unwrap();
        let back: DialogCoreConfig = serde_json::from_str(&json).unwrap();
        assert!(back.ua.late_media);
        assert_eq!(back.transaction.timers, TimerSettings::default());
    }
}
