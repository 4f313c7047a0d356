//! UDP server with reader, sender and resolver task pools.
//!
//! One bound socket is shared by `nreaders` reader tasks that push every
//! datagram to the installed [`DatagramHandler`], and `nsenders` sender tasks
//! draining a common outbound queue. Destinations given as host names go
//! through a separate queue served by `nresolvers` resolver tasks first, so a
//! slow DNS lookup never delays datagrams to IP literals.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_infra_common::MonoTime;
use b2bua_sip_core::HostPort;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::UdpServerConfig;
use crate::error::{Error, Result};
use crate::transport::{Datagram, DatagramHandler, Transport};

/// Largest datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 65535;

const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(10);

struct Outbound {
    data: Bytes,
    destination: SocketAddr,
}

struct Unresolved {
    data: Bytes,
    destination: HostPort,
}

type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>>;

/// UDP transport bound to one local address
pub struct UdpServer {
    me: Weak<UdpServer>,
    socket: Arc<UdpSocket>,
    local: HostPort,
    config: UdpServerConfig,
    send_tx: mpsc::UnboundedSender<Outbound>,
    resolve_tx: mpsc::UnboundedSender<Unresolved>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpServer {
    /// Bind `config.bind_address` and start the worker pools. Must be called
    /// from within a tokio runtime.
    pub fn bind(config: UdpServerConfig, handler: DatagramHandler) -> Result<Arc<UdpServer>> {
        let handle = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let addr = config
            .bind_address
            .socket_addr()
            .ok_or_else(|| Error::Resolve(config.bind_address.host.clone()))?;

        let std_socket = std::net::UdpSocket::bind(addr).map_err(|source| Error::Bind {
            address: addr.to_string(),
            source,
        })?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket)?
        };
        let local = HostPort::from(socket.local_addr()?);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();
        let server = Arc::new_cyclic(|me| UdpServer {
            me: me.clone(),
            socket: Arc::new(socket),
            local,
            config,
            send_tx,
            resolve_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        server.spawn_workers(
            &handle,
            handler,
            Arc::new(tokio::sync::Mutex::new(send_rx)),
            Arc::new(tokio::sync::Mutex::new(resolve_rx)),
        );

        info!(local = %server.local, "SIP UDP server started");
        Ok(server)
    }

    fn spawn_workers(
        &self,
        handle: &Handle,
        handler: DatagramHandler,
        send_rx: SharedReceiver<Outbound>,
        resolve_rx: SharedReceiver<Unresolved>,
    ) {
        let mut tasks = self.tasks.lock();
        for _ in 0..self.config.nreaders.max(1) {
            tasks.push(handle.spawn(Self::reader(
                self.me.clone(),
                self.socket.clone(),
                handler.clone(),
            )));
        }
        for _ in 0..self.config.nsenders.max(1) {
            tasks.push(handle.spawn(Self::sender(
                self.socket.clone(),
                send_rx.clone(),
                self.config.send_attempts.max(1),
            )));
        }
        for _ in 0..self.config.nresolvers.max(1) {
            tasks.push(handle.spawn(Self::resolver(
                resolve_rx.clone(),
                self.send_tx.clone(),
                self.local.ip().map(|ip| ip.is_ipv4()).unwrap_or(true),
            )));
        }
    }

    async fn reader(me: Weak<UdpServer>, socket: Arc<UdpSocket>, handler: DatagramHandler) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = socket.recv_from(&mut buf).await;
            let Some(server) = me.upgrade() else {
                break;
            };
            if server.is_closed() {
                break;
            }
            let (len, source) = match received {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    debug!(local = %server.local, "UDP receive error: {}", e);
                    continue;
                }
            };
            let rtime = match MonoTime::now() {
                Ok(t) => t,
                Err(e) => {
                    error!("Dropping datagram, cannot read the clock: {}", e);
                    continue;
                }
            };
            trace!(local = %server.local, %source, len, "datagram received");
            let transport: Arc<dyn Transport> = server;
            handler(Datagram {
                data: Bytes::copy_from_slice(&buf[..len]),
                source: HostPort::from(source),
                transport,
                rtime,
            });
        }
    }

    async fn sender(socket: Arc<UdpSocket>, queue: SharedReceiver<Outbound>, attempts: u32) {
        loop {
            let next = { queue.lock().await.recv().await };
            let Some(out) = next else {
                break;
            };
            for attempt in 1..=attempts {
                match socket.send_to(&out.data, out.destination).await {
                    Ok(_) => break,
                    Err(e) if attempt < attempts => {
                        debug!(destination = %out.destination, attempt, "UDP send failed, retrying: {}", e);
                        tokio::time::sleep(SEND_RETRY_BACKOFF * attempt).await;
                    }
                    Err(e) => {
                        error!(destination = %out.destination, "UDP send failed, datagram dropped: {}", e);
                    }
                }
            }
        }
    }

    async fn resolver(
        queue: SharedReceiver<Unresolved>,
        send_tx: mpsc::UnboundedSender<Outbound>,
        want_ipv4: bool,
    ) {
        loop {
            let next = { queue.lock().await.recv().await };
            let Some(item) = next else {
                break;
            };
            let host = item.destination.host.as_str();
            let resolved = match tokio::net::lookup_host((host, item.destination.port)).await {
                Ok(mut addrs) => addrs.find(|a| a.is_ipv4() == want_ipv4),
                Err(e) => {
                    error!(destination = %item.destination, "Cannot resolve destination: {}", e);
                    continue;
                }
            };
            let Some(destination) = resolved else {
                error!(destination = %item.destination, "No usable address for destination");
                continue;
            };
            if send_tx
                .send(Outbound {
                    data: item.data,
                    destination,
                })
                .is_err()
            {
                break;
            }
        }
    }

    pub fn config(&self) -> &UdpServerConfig {
        &self.config
    }
}

impl Transport for UdpServer {
    fn send_to(&self, data: Bytes, destination: &HostPort) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match destination.socket_addr() {
            Some(addr) => self
                .send_tx
                .send(Outbound {
                    data,
                    destination: addr,
                })
                .map_err(|_| Error::Closed),
            None => self
                .resolve_tx
                .send(Unresolved {
                    data,
                    destination: destination.clone(),
                })
                .map_err(|_| Error::Closed),
        }
    }

    fn local_addr(&self) -> HostPort {
        self.local.clone()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(local = %self.local, "SIP UDP server stopped");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpServer({})", self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_handler() -> (DatagramHandler, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: DatagramHandler = Arc::new(move |dgram| {
            let _ = tx.send(dgram);
        });
        (handler, rx)
    }

    fn loopback() -> UdpServerConfig {
        UdpServerConfig::new(HostPort::new("127.0.0.1", 0)).with_workers(2, 2, 1)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (h1, _rx1) = channel_handler();
        let (h2, mut rx2) = channel_handler();
        let a = UdpServer::bind(loopback(), h1).unwrap();
        let b = UdpServer::bind(loopback(), h2).unwrap();

        a.send_to(Bytes::from_static(b"OPTIONS"), &b.local_addr()).unwrap();
        let dgram = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&dgram.data[..], b"OPTIONS");
        assert_eq!(dgram.source, a.local_addr());
        assert_eq!(dgram.transport.local_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn test_host_name_destination_is_resolved() {
        let (h1, _rx1) = channel_handler();
        let (h2, mut rx2) = channel_handler();
        let a = UdpServer::bind(loopback(), h1).unwrap();
        let b = UdpServer::bind(loopback(), h2).unwrap();

        let by_name = HostPort::new("localhost", b.local_addr().port);
        a.send_to(Bytes::from_static(b"BYE"), &by_name).unwrap();
        let dgram = tokio::time::timeout(Duration::from_secs(5), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&dgram.data[..], b"BYE");
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (h, _rx) = channel_handler();
        let a = UdpServer::bind(loopback(), h).unwrap();
        a.shutdown();
        assert!(a.is_closed());
        let dest = HostPort::new("127.0.0.1", 9);
        assert!(matches!(a.send_to(Bytes::from_static(b"x"), &dest), Err(Error::Closed)));
    }
}
