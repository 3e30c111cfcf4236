//! Per-listener session state

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::constants::MAX_CLIENTS;
use crate::error::ProtocolError;

/// Monotonic timestamp readable without a lock.
///
/// Stores milliseconds elapsed since creation; heartbeat loops load while
/// read loops store, and Relaxed ordering is enough for a liveness stamp.
pub struct AtomicInstant {
    epoch: Instant,
    millis: AtomicU64,
}

impl AtomicInstant {
    pub fn now() -> Self {
        Self {
            epoch: Instant::now(),
            millis: AtomicU64::new(0),
        }
    }

    /// Move the stamp to the current instant
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.millis.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the stamp was last touched
    pub fn elapsed(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.millis.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// A listener that completed the START_PLAY handshake
pub struct PeerInfo {
    pub id: u32,
    /// Remote address of the control connection
    pub addr: SocketAddr,
    udp_endpoint: Mutex<Option<SocketAddr>>,
    pub last_tick: AtomicInstant,
    /// Set once an address-family mismatch has been logged for this peer
    family_warned: AtomicBool,
}

impl PeerInfo {
    fn new(id: u32, addr: SocketAddr) -> Self {
        let last_tick = AtomicInstant::now();
        last_tick.touch();
        Self {
            id,
            addr,
            udp_endpoint: Mutex::new(None),
            last_tick,
            family_warned: AtomicBool::new(false),
        }
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        *self.udp_endpoint.lock().unwrap()
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_tick.elapsed() > timeout
    }
}

struct RegistryInner {
    peers: HashMap<u64, Arc<PeerInfo>>,
    next_id: u32,
}

/// Playing listeners, keyed by control-connection identity.
///
/// Peer ids start at 1 and increase strictly for the lifetime of the
/// server; id 0 stays reserved for "unknown".
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                peers: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Admit a connection on START_PLAY
    pub fn add(&self, conn_id: u64, addr: SocketAddr) -> Result<Arc<PeerInfo>, ProtocolError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.contains_key(&conn_id) {
            return Err(ProtocolError::DuplicateStartPlay);
        }
        if inner.peers.len() >= MAX_CLIENTS {
            return Err(ProtocolError::ServerFull);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let info = Arc::new(PeerInfo::new(id, addr));
        inner.peers.insert(conn_id, info.clone());
        trace!("add peer id:{} tcp://{}", id, addr);
        Ok(info)
    }

    pub fn remove(&self, conn_id: u64) -> Option<Arc<PeerInfo>> {
        let removed = self.inner.lock().unwrap().peers.remove(&conn_id);
        if let Some(info) = &removed {
            trace!("remove peer id:{} tcp://{}", info.id, info.addr);
        }
        removed
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<PeerInfo>> {
        self.inner.lock().unwrap().peers.get(&conn_id).cloned()
    }

    pub fn contains(&self, conn_id: u64) -> bool {
        self.inner.lock().unwrap().peers.contains_key(&conn_id)
    }

    /// Refresh the liveness stamp of a connection's peer, if it has one
    pub fn touch(&self, conn_id: u64) -> bool {
        match self.get(conn_id) {
            Some(info) => {
                info.last_tick.touch();
                true
            }
            None => false,
        }
    }

    /// Attach a datagram source endpoint to the peer with this id.
    ///
    /// IPv4-mapped IPv6 sources (seen when a dual-stack listener talks to
    /// an IPv4 server) are unwrapped to plain IPv4. Returns the endpoint as
    /// stored, or `None` when no playing peer has the id.
    pub fn fill_udp_endpoint(&self, id: u32, endpoint: SocketAddr) -> Option<SocketAddr> {
        let endpoint = unmap_v4(endpoint);
        let inner = self.inner.lock().unwrap();
        let info = inner.peers.values().find(|info| info.id == id)?;
        *info.udp_endpoint.lock().unwrap() = Some(endpoint);
        Some(endpoint)
    }

    /// Endpoints eligible for one fan-out pass: registered, and of the same
    /// address family as the datagram socket. Mismatches are logged once
    /// per peer.
    pub fn endpoints_for(&self, server_is_v4: bool) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        let mut endpoints = Vec::with_capacity(inner.peers.len());
        for info in inner.peers.values() {
            let Some(endpoint) = info.udp_endpoint() else {
                continue;
            };
            if endpoint.is_ipv4() == server_is_v4 {
                endpoints.push(endpoint);
            } else if !info.family_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "address family mismatch for peer id:{} - server is {}, listener is {}",
                    info.id,
                    if server_is_v4 { "IPv4" } else { "IPv6" },
                    if endpoint.is_ipv4() { "IPv4" } else { "IPv6" },
                );
            }
        }
        endpoints
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().peers.clear();
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unmap_v4(endpoint: SocketAddr) -> SocketAddr {
    if let IpAddr::V6(v6) = endpoint.ip() {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), endpoint.port());
        }
    }
    endpoint
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::thread;

    fn tcp_addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), 50000)
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let registry = PeerRegistry::new();
        let a = registry.add(10, tcp_addr(1)).unwrap();
        let b = registry.add(11, tcp_addr(2)).unwrap();
        let c = registry.add(12, tcp_addr(3)).unwrap();
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));

        // ids are never reused, even after a removal
        registry.remove(11);
        let d = registry.add(13, tcp_addr(4)).unwrap();
        assert_eq!(d.id, 4);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let registry = PeerRegistry::new();
        registry.add(10, tcp_addr(1)).unwrap();
        assert!(matches!(
            registry.add(10, tcp_addr(1)),
            Err(ProtocolError::DuplicateStartPlay)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_admission_cap() {
        let registry = PeerRegistry::new();
        for conn in 0..MAX_CLIENTS as u64 {
            registry.add(conn, tcp_addr(1)).unwrap();
        }
        assert!(matches!(
            registry.add(MAX_CLIENTS as u64, tcp_addr(1)),
            Err(ProtocolError::ServerFull)
        ));
    }

    #[test]
    fn test_fill_udp_endpoint() {
        let registry = PeerRegistry::new();
        let info = registry.add(10, tcp_addr(1)).unwrap();

        let endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 40000);
        assert_eq!(registry.fill_udp_endpoint(info.id, endpoint), Some(endpoint));
        assert_eq!(info.udp_endpoint(), Some(endpoint));

        // unknown ids are dropped
        assert_eq!(registry.fill_udp_endpoint(99, endpoint), None);
    }

    #[test]
    fn test_v4_mapped_source_unwrapped() {
        let registry = PeerRegistry::new();
        let info = registry.add(10, tcp_addr(1)).unwrap();

        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(192, 168, 1, 10).to_ipv6_mapped()),
            40000,
        );
        let stored = registry.fill_udp_endpoint(info.id, mapped).unwrap();
        assert_eq!(
            stored,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 40000)
        );
    }

    #[test]
    fn test_endpoints_filtered_by_family() {
        let registry = PeerRegistry::new();
        let v4_peer = registry.add(10, tcp_addr(1)).unwrap();
        let v6_peer = registry.add(11, tcp_addr(2)).unwrap();
        let unregistered = registry.add(12, tcp_addr(3)).unwrap();

        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 40000);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)), 40001);
        registry.fill_udp_endpoint(v4_peer.id, v4);
        registry.fill_udp_endpoint(v6_peer.id, v6);
        let _ = unregistered;

        assert_eq!(registry.endpoints_for(true), vec![v4]);
        assert_eq!(registry.endpoints_for(false), vec![v6]);
    }

    #[test]
    fn test_staleness() {
        let registry = PeerRegistry::new();
        let info = registry.add(10, tcp_addr(1)).unwrap();

        assert!(!info.is_stale(Duration::from_millis(50)));
        thread::sleep(Duration::from_millis(80));
        assert!(info.is_stale(Duration::from_millis(50)));

        assert!(registry.touch(10));
        assert!(!info.is_stale(Duration::from_millis(50)));
        assert!(!registry.touch(99));
    }
}
