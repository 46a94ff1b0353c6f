use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PeerEntry {
    addr: SocketAddr,
    registered_at: Instant,
    last_seen: Option<Instant>,
    reachable: bool,
}

impl PeerEntry {
    fn silent_since(&self) -> Instant {
        self.last_seen.unwrap_or(self.registered_at)
    }
}

/// The set of known peers in the order they were added, with per-peer liveness information.
///
/// Readers get copies (see [PeerRegistry::list]) so they never observe concurrent modification.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        Default::default()
    }

    /// returns `false` if the peer was registered before
    pub fn add(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if self.contains(addr) {
            debug!("peer {:?} is already registered", addr);
            return false;
        }

        info!("registering peer {:?}", addr);
        self.peers.push(PeerEntry {
            addr,
            registered_at: now,
            last_seen: None,
            reachable: true,
        });
        true
    }

    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        let len_before = self.peers.len();
        self.peers.retain(|p| p.addr != addr);
        let removed = self.peers.len() != len_before;
        if removed {
            info!("removed peer {:?}", addr);
        }
        removed
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.peers.iter().any(|p| p.addr == addr)
    }

    pub fn list(&self) -> Vec<SocketAddr> {
        self.peers.iter()
            .map(|p| p.addr)
            .collect()
    }

    pub fn last_seen(&self, addr: SocketAddr) -> Option<Instant> {
        self.peers.iter()
            .find(|p| p.addr == addr)
            .and_then(|p| p.last_seen)
    }

    pub fn is_reachable(&self, addr: SocketAddr) -> Option<bool> {
        self.peers.iter()
            .find(|p| p.addr == addr)
            .map(|p| p.reachable)
    }

    /// Records a sign of life from a peer. Returns `true` iff the peer was considered unreachable
    ///  before, i.e. if it just became reachable again.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.iter_mut().find(|p| p.addr == addr) {
            Some(peer) => {
                peer.last_seen = Some(now);
                let was_unreachable = !peer.reachable;
                peer.reachable = true;
                was_unreachable
            }
            None => {
                debug!("sign of life from unregistered peer {:?} - ignoring", addr);
                false
            }
        }
    }

    /// Marks peers that were not heard from for longer than `timeout` as unreachable, returning
    ///  those that were reachable before.
    pub fn newly_silent(&mut self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut result = Vec::new();
        for peer in self.peers.iter_mut() {
            if peer.reachable && now.saturating_duration_since(peer.silent_since()) > timeout {
                peer.reachable = false;
                result.push(peer.addr);
            }
        }
        result
    }
}
