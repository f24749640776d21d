//! Peer registry: the full peers this node has joined or been joined by.
//!
//! Address lookups fan out to every connected peer in this registry, and
//! address announcements go to the same set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Joined and answering.
    Connected,
    /// Last contact failed; kept so a later join can revive it.
    Disconnected,
}

/// How to reach a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub peer_id: String,
    /// Listen address of the peer's native transport.
    pub addr: SocketAddr,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: String,
    /// Hex Ed25519 key proven during the handshake.
    pub public_key: String,
    pub address: SocketAddr,
    pub state: PeerState,
    pub connected_at: DateTime<Utc>,
}

impl PeerEntry {
    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            peer_id: self.peer_id.clone(),
            addr: self.address,
        }
    }
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or refresh a peer after a successful join.
    ///
    /// Returns `true` when the peer was not connected before.
    pub fn add_peer(&self, entry: PeerEntry) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let was_connected = peers
            .get(&entry.peer_id)
            .map(|p| p.state == PeerState::Connected && p.address == entry.address)
            .unwrap_or(false);
        peers.insert(entry.peer_id.clone(), entry);
        !was_connected
    }

    /// Mark a peer as disconnected (but keep its entry for a later join).
    pub fn mark_disconnected(&self, peer_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.state = PeerState::Disconnected;
        }
    }

    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(peer_id: &str, port: u16) -> PeerEntry {
        PeerEntry {
            peer_id: peer_id.to_string(),
            public_key: format!("{peer_id}-key"),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            state: PeerState::Connected,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_and_list_peer() {
        let registry = PeerRegistry::new();
        assert!(registry.add_peer(make_peer("peer-1", 9000)));
        let peers = registry.connected_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address.port(), 9000);
        assert_eq!(peers[0].peer_ref().peer_id, "peer-1");
    }

    #[test]
    fn test_readd_is_not_new() {
        let registry = PeerRegistry::new();
        assert!(registry.add_peer(make_peer("peer-1", 9000)));
        assert!(!registry.add_peer(make_peer("peer-1", 9000)));
        // A peer that moved is new again.
        assert!(registry.add_peer(make_peer("peer-1", 9001)));
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.connected_peers()[0].address.port(), 9001);
    }

    #[test]
    fn test_disconnected_peer_rejoins_as_new() {
        let registry = PeerRegistry::new();
        registry.add_peer(make_peer("peer-1", 9000));
        assert_eq!(registry.connected_count(), 1);

        registry.mark_disconnected("peer-1");
        assert_eq!(registry.connected_count(), 0);
        assert!(registry.connected_peers().is_empty());
        assert!(registry.add_peer(make_peer("peer-1", 9000)));
        assert_eq!(registry.connected_count(), 1);
    }
}
