//! SIP transport layer for the B2BUA stack
//!
//! Datagram transport only: a [`Transport`] trait, the tokio based
//! [`UdpServer`] implementing it, and [`LocalForRemote`], which picks the
//! local socket and advertised address to use for each remote peer.

pub mod config;
pub mod error;
pub mod local_for_remote;
pub mod transport;

pub use config::UdpServerConfig;
pub use error::{Error, Result};
pub use local_for_remote::{
    LocalBinding, LocalForRemote, TransportFactory, UdpServerFactory, DEFAULT_ROTATE_INTERVAL,
};
pub use transport::udp::UdpServer;
pub use transport::{Datagram, DatagramHandler, Transport};
