//! Local address selection per remote host.
//!
//! On a multi-homed box the right source address depends on the route to the
//! peer. [`LocalForRemote`] asks the OS by connecting a throwaway UDP socket
//! to the peer and reading back its local address, then remembers the answer
//! per remote host. The cache has two generations swapped on a fixed interval,
//! so an entry that stops being used is forgotten after at most two intervals
//! and route or NAT changes heal on their own.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Weak};
use std::time::Duration;

use b2bua_infra_common::Timeout;
use b2bua_sip_core::HostPort;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::UdpServerConfig;
use crate::error::Result;
use crate::transport::udp::UdpServer;
use crate::transport::{DatagramHandler, Transport};

/// Default cache generation lifetime
pub const DEFAULT_ROTATE_INTERVAL: Duration = Duration::from_secs(32);

/// Creates transports bound to a local address on demand
pub trait TransportFactory: Send + Sync {
    fn create(&self, laddress: &HostPort) -> Result<Arc<dyn Transport>>;
}

/// Factory binding [`UdpServer`]s that share one receive handler
pub struct UdpServerFactory {
    config: UdpServerConfig,
    handler: DatagramHandler,
}

impl UdpServerFactory {
    pub fn new(config: UdpServerConfig, handler: DatagramHandler) -> Self {
        UdpServerFactory { config, handler }
    }
}

impl TransportFactory for UdpServerFactory {
    fn create(&self, laddress: &HostPort) -> Result<Arc<dyn Transport>> {
        let server = UdpServer::bind(self.config.rebind(laddress.clone()), self.handler.clone())?;
        Ok(server)
    }
}

/// Transport chosen for a destination and the local address to advertise
/// (Via sent-by, Contact) when using it
#[derive(Clone, Debug)]
pub struct LocalBinding {
    pub transport: Arc<dyn Transport>,
    pub laddress: HostPort,
}

#[derive(Default)]
struct Generations {
    current: HashMap<String, HostPort>,
    previous: HashMap<String, HostPort>,
}

impl Generations {
    fn get(&mut self, host: &str) -> Option<HostPort> {
        if let Some(laddress) = self.current.get(host) {
            return Some(laddress.clone());
        }
        let laddress = self.previous.remove(host)?;
        self.current.insert(host.to_string(), laddress.clone());
        Some(laddress)
    }

    fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }
}

/// Picks the local socket to talk to a given remote address from
pub struct LocalForRemote {
    default: Arc<dyn Transport>,
    fixed: bool,
    factory: Option<Arc<dyn TransportFactory>>,
    cache: Mutex<Generations>,
    servers: Mutex<HashMap<HostPort, Arc<dyn Transport>>>,
    rotator: Mutex<Option<Timeout>>,
}

impl LocalForRemote {
    /// Always use `transport`
    pub fn fixed(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(LocalForRemote {
            default: transport,
            fixed: true,
            factory: None,
            cache: Mutex::new(Generations::default()),
            servers: Mutex::new(HashMap::new()),
            rotator: Mutex::new(None),
        })
    }

    /// Select per destination, binding extra transports through `factory`
    /// when the OS picks a local address `default` is not bound to
    pub fn new(
        default: Arc<dyn Transport>,
        factory: Arc<dyn TransportFactory>,
        rotate_interval: Duration,
    ) -> Arc<Self> {
        let lfr = Arc::new(LocalForRemote {
            default,
            fixed: false,
            factory: Some(factory),
            cache: Mutex::new(Generations::default()),
            servers: Mutex::new(HashMap::new()),
            rotator: Mutex::new(None),
        });
        let weak: Weak<LocalForRemote> = Arc::downgrade(&lfr);
        let rotator = Timeout::start_new(
            move || {
                if let Some(lfr) = weak.upgrade() {
                    lfr.rotate();
                }
            },
            None,
            rotate_interval,
            -1,
        );
        *lfr.rotator.lock() = Some(rotator);
        lfr
    }

    pub fn default_transport(&self) -> Arc<dyn Transport> {
        self.default.clone()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Transport and advertised local address for talking to `remote`
    pub fn binding_for(&self, remote: &HostPort) -> LocalBinding {
        let default = self.default_binding();
        if self.fixed {
            return default;
        }
        let Some(remote_addr) = remote.socket_addr() else {
            // Host names are resolved by the transport; routing is unknown here
            return default;
        };

        let cached = self.cache.lock().get(&remote.host);
        let laddress = match cached {
            Some(laddress) => laddress,
            None => match probe_local_ip(&remote_addr) {
                Ok(ip) => {
                    let laddress = HostPort::new(ip.to_string(), default.laddress.port);
                    debug!(%remote, %laddress, "local address selected");
                    self.cache.lock().current.insert(remote.host.clone(), laddress.clone());
                    laddress
                }
                Err(e) => {
                    warn!(%remote, "Cannot find a local address for remote: {}", e);
                    return default;
                }
            },
        };
        self.binding_at(laddress).unwrap_or(default)
    }

    fn default_binding(&self) -> LocalBinding {
        LocalBinding {
            transport: self.default.clone(),
            laddress: self.default.local_addr(),
        }
    }

    fn binding_at(&self, laddress: HostPort) -> Option<LocalBinding> {
        let default_local = self.default.local_addr();
        if laddress == default_local {
            return Some(self.default_binding());
        }
        // A wildcard socket can send from any local address
        if default_local.ip().map(|ip| ip.is_unspecified()).unwrap_or(false) {
            return Some(LocalBinding {
                transport: self.default.clone(),
                laddress,
            });
        }

        if let Some(transport) = self.servers.lock().get(&laddress) {
            return Some(LocalBinding {
                transport: transport.clone(),
                laddress,
            });
        }
        let factory = self.factory.as_ref()?;
        match factory.create(&laddress) {
            Ok(transport) => {
                info!(%laddress, "bound additional local transport");
                let transport = self
                    .servers
                    .lock()
                    .entry(laddress.clone())
                    .or_insert(transport)
                    .clone();
                Some(LocalBinding {
                    transport,
                    laddress,
                })
            }
            Err(e) => {
                warn!(%laddress, "Cannot bind local transport, using default: {}", e);
                None
            }
        }
    }

    /// Age the cache by one generation
    pub fn rotate(&self) {
        self.cache.lock().rotate();
    }

    /// Every transport in use, the default first
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        let mut all = vec![self.default.clone()];
        all.extend(self.servers.lock().values().cloned());
        all
    }

    pub fn shutdown(&self) {
        if let Some(rotator) = self.rotator.lock().take() {
            rotator.cancel();
        }
        let servers: Vec<_> = self.servers.lock().drain().map(|(_, t)| t).collect();
        for server in servers {
            server.shutdown();
        }
        self.default.shutdown();
    }
}

impl fmt::Debug for LocalForRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalForRemote")
            .field("default", &self.default.local_addr())
            .field("fixed", &self.fixed)
            .finish()
    }
}

fn probe_local_ip(remote: &SocketAddr) -> io::Result<IpAddr> {
    let bind: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(remote)?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use crate::error::Error;

    #[derive(Debug)]
    struct FakeTransport {
        local: HostPort,
    }

    impl Transport for FakeTransport {
        fn send_to(&self, _data: Bytes, _destination: &HostPort) -> Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> HostPort {
            self.local.clone()
        }

        fn shutdown(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    impl TransportFactory for CountingFactory {
        fn create(&self, laddress: &HostPort) -> Result<Arc<dyn Transport>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            if laddress.host == "refuse" {
                return Err(Error::Closed);
            }
            Ok(Arc::new(FakeTransport {
                local: laddress.clone(),
            }))
        }
    }

    fn fake(host: &str, port: u16) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            local: HostPort::new(host, port),
        })
    }

    #[test]
    fn test_generations_promote_and_expire() {
        let mut g = Generations::default();
        g.current.insert("10.0.0.1".to_string(), HostPort::new("10.0.0.9", 5060));
        g.rotate();
        assert!(g.current.is_empty());
        // A hit in the previous generation moves the entry forward
        assert!(g.get("10.0.0.1").is_some());
        g.rotate();
        g.rotate();
        assert!(g.get("10.0.0.1").is_none());
    }

    #[test]
    fn test_fixed_ignores_destination() {
        let lfr = LocalForRemote::fixed(fake("192.0.2.1", 5060));
        let binding = lfr.binding_for(&HostPort::new("127.0.0.1", 5080));
        assert_eq!(binding.laddress, HostPort::new("192.0.2.1", 5060));
    }

    #[tokio::test]
    async fn test_wildcard_default_advertises_probed_address() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let lfr = LocalForRemote::new(fake("0.0.0.0", 5060), factory.clone(), DEFAULT_ROTATE_INTERVAL);
        let binding = lfr.binding_for(&HostPort::new("127.0.0.1", 5080));
        assert_eq!(binding.laddress, HostPort::new("127.0.0.1", 5060));
        assert_eq!(binding.transport.local_addr(), HostPort::new("0.0.0.0", 5060));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        lfr.shutdown();
    }

    #[tokio::test]
    async fn test_specific_default_binds_extra_transport_once() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let lfr = LocalForRemote::new(fake("192.0.2.1", 5060), factory.clone(), DEFAULT_ROTATE_INTERVAL);
        let remote = HostPort::new("127.0.0.1", 5080);
        let first = lfr.binding_for(&remote);
        let second = lfr.binding_for(&remote);
        assert_eq!(first.laddress, HostPort::new("127.0.0.1", 5060));
        assert_eq!(second.transport.local_addr(), first.transport.local_addr());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(lfr.transports().len(), 2);
        lfr.shutdown();
    }

    #[tokio::test]
    async fn test_host_name_uses_default() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let lfr = LocalForRemote::new(fake("192.0.2.1", 5060), factory, DEFAULT_ROTATE_INTERVAL);
        let binding = lfr.binding_for(&HostPort::new("sip.example.com", 5060));
        assert_eq!(binding.laddress, HostPort::new("192.0.2.1", 5060));
        lfr.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_timer_ages_cache() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let lfr = LocalForRemote::new(fake("0.0.0.0", 5060), factory, Duration::from_secs(32));
        lfr.binding_for(&HostPort::new("127.0.0.1", 5080));
        assert!(lfr.cache.lock().current.contains_key("127.0.0.1"));

        tokio::time::sleep(Duration::from_secs(33)).await;
        assert!(lfr.cache.lock().current.is_empty());
        assert!(lfr.cache.lock().previous.contains_key("127.0.0.1"));

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert!(lfr.cache.lock().previous.is_empty());
        lfr.shutdown();
    }
}
