//! Response cache for duplicate request suppression
//!
//! Every request that created a server transaction, and every datagram that
//! was deliberately ignored, is remembered by the MD5 of its raw bytes. A
//! retransmission of the same bytes is answered from here with the last
//! response sent for it (or dropped when no response is due) before it is
//! even parsed. Entries live in two generations that rotate every
//! `cache_rotate_interval`, so a duplicate is recognised for between one and
//! two intervals.
//!
//! Two different requests with the same digest would be treated as one; the
//! stack accepts that risk.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use b2bua_sip_core::HostPort;
use b2bua_sip_transport::Transport;
use bytes::Bytes;
use md5::{Digest, Md5};

/// MD5 digest of a raw datagram
pub type Checksum = [u8; 16];

pub fn checksum(data: &[u8]) -> Checksum {
    let digest = Md5::digest(data);
    let mut sum = [0u8; 16];
    sum.copy_from_slice(&digest);
    sum
}

/// What to do when the datagram with a cached checksum shows up again
#[derive(Clone)]
pub struct CacheEntry {
    pub transport: Arc<dyn Transport>,
    /// Response to replay; `None` means drop silently
    pub data: Option<Bytes>,
    pub destination: HostPort,
    pub call_id: String,
    /// Replays still to be swallowed to emulate packet loss
    pub lossemul: u32,
}

impl CacheEntry {
    /// Entry that silently absorbs duplicates
    pub fn suppress(transport: Arc<dyn Transport>, destination: HostPort, call_id: &str) -> Self {
        CacheEntry {
            transport,
            data: None,
            destination,
            call_id: call_id.to_string(),
            lossemul: 0,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("destination", &self.destination)
            .field("call_id", &self.call_id)
            .field("len", &self.data.as_ref().map(Bytes::len))
            .field("lossemul", &self.lossemul)
            .finish()
    }
}

/// Two generation checksum map
#[derive(Debug, Default)]
pub struct ResponseCache {
    current: HashMap<Checksum, CacheEntry>,
    previous: HashMap<Checksum, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, sum: &Checksum) -> Option<&mut CacheEntry> {
        match self.current.get_mut(sum) {
            Some(entry) => Some(entry),
            None => self.previous.get_mut(sum),
        }
    }

    pub fn contains(&self, sum: &Checksum) -> bool {
        self.current.contains_key(sum) || self.previous.contains_key(sum)
    }

    /// Insert or replace; a replaced entry in the previous generation moves
    /// to the current one
    pub fn insert(&mut self, sum: Checksum, entry: CacheEntry) {
        self.previous.remove(&sum);
        self.current.insert(sum, entry);
    }

    /// Forget the older generation and start a new one
    pub fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullTransport;

    impl Transport for NullTransport {
        fn send_to(&self, _data: Bytes, _destination: &HostPort) -> b2bua_sip_transport::Result<()> {
            Ok(())
        }
        fn local_addr(&self) -> HostPort {
            HostPort::new("127.0.0.1", 5060)
        }
        fn shutdown(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn entry(data: Option<&'static [u8]>) -> CacheEntry {
        CacheEntry {
            transport: Arc::new(NullTransport),
            data: data.map(Bytes::from_static),
            destination: HostPort::new("10.0.0.1", 5060),
            call_id: "abc".to_string(),
            lossemul: 0,
        }
    }

    #[test]
    fn test_checksum_is_content_hash() {
        assert_eq!(checksum(b"INVITE"), checksum(b"INVITE"));
        assert_ne!(checksum(b"INVITE"), checksum(b"INVITe"));
    }

    #[test]
    fn test_entries_survive_one_rotation() {
        let mut cache = ResponseCache::new();
        let sum = checksum(b"BYE");
        cache.insert(sum, entry(Some(b"SIP/2.0 200 OK")));
        cache.rotate();
        assert!(cache.contains(&sum));
        assert_eq!(cache.get_mut(&sum).unwrap().data.as_deref(), Some(&b"SIP/2.0 200 OK"[..]));
        cache.rotate();
        assert!(!cache.contains(&sum));
    }

    #[test]
    fn test_update_refreshes_generation() {
        let mut cache = ResponseCache::new();
        let sum = checksum(b"INVITE");
        cache.insert(sum, entry(None));
        cache.rotate();
        cache.insert(sum, entry(Some(b"SIP/2.0 180 Ringing")));
        cache.rotate();
        assert!(cache.contains(&sum));
        assert_eq!(cache.len(), 1);
    }
}
