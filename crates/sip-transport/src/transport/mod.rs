//! Transport abstraction.
//!
//! The transaction layer only ever sees [`Transport`]: a datagram sink bound
//! to one local address. Receiving is push based; every transport delivers
//! what it reads to a [`DatagramHandler`] as a [`Datagram`].

pub mod udp;

use std::fmt;
use std::sync::Arc;

use b2bua_infra_common::MonoTime;
use b2bua_sip_core::HostPort;
use bytes::Bytes;

use crate::error::Result;

/// A datagram sink bound to one local address
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue `data` for delivery to `destination`. Host names are resolved
    /// off the caller's path, IP literals go straight to the send queue.
    /// Delivery failures after queueing are logged, not reported.
    fn send_to(&self, data: Bytes, destination: &HostPort) -> Result<()>;

    /// Local address datagrams are sent from
    fn local_addr(&self) -> HostPort;

    /// Stop all worker tasks. Further sends fail with `Error::Closed`.
    fn shutdown(&self);

    fn is_closed(&self) -> bool;
}

/// One received datagram
#[derive(Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub source: HostPort,
    /// Transport the datagram arrived on, for sending replies
    pub transport: Arc<dyn Transport>,
    pub rtime: MonoTime,
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("len", &self.data.len())
            .field("source", &self.source)
            .field("local", &self.transport.local_addr())
            .finish()
    }
}

/// Receive callback installed on every transport
pub type DatagramHandler = Arc<dyn Fn(Datagram) + Send + Sync>;
