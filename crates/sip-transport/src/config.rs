use serde::{Deserialize, Serialize};

use b2bua_sip_core::HostPort;

/// UDP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpServerConfig {
    /// Address to bind. Port 0 picks an ephemeral port.
    pub bind_address: HostPort,
    /// Always use the bound socket instead of picking a local address per
    /// destination
    pub fixed: bool,
    /// Reader tasks sharing the socket
    pub nreaders: usize,
    /// Sender tasks draining the outbound queue
    pub nsenders: usize,
    /// DNS resolution tasks
    pub nresolvers: usize,
    /// Attempts per datagram before a send error is logged and the datagram
    /// dropped
    pub send_attempts: u32,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        UdpServerConfig {
            bind_address: HostPort::new("0.0.0.0", 5060),
            fixed: false,
            nreaders: 4,
            nsenders: 4,
            nresolvers: 2,
            send_attempts: 3,
        }
    }
}

impl UdpServerConfig {
    pub fn new(bind_address: HostPort) -> Self {
        UdpServerConfig {
            bind_address,
            ..Default::default()
        }
    }

    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn with_workers(mut self, nreaders: usize, nsenders: usize, nresolvers: usize) -> Self {
        self.nreaders = nreaders.max(1);
        self.nsenders = nsenders.max(1);
        self.nresolvers = nresolvers.max(1);
        self
    }

    /// Same settings bound to another address
    pub fn rebind(&self, bind_address: HostPort) -> Self {
        UdpServerConfig {
            bind_address,
            ..self.clone()
        }
    }
}
