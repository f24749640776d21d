//! Address directory: which peer represents which agent address.
//!
//! The directory answers from local state first, in a fixed order: the
//! directly attached agent, relay clients, delegate clients, then the shard
//! of remote entries this peer has learned through announcements and
//! lookups. On a miss, [`AddressDirectory::resolve`] asks every connected
//! peer and keeps the first answer whose record verifies.
//!
//! Shard entries are keyed by [`DirectoryKey`], the SHA-256 of the address,
//! and expire after a TTL. Failed resolutions are remembered for a short
//! negative TTL so a burst of envelopes to a vanished agent does not turn
//! into a burst of lookups.

use crate::clients::ClientRegistry;
use crate::handshake::peer_id_for;
use crate::registry::{PeerEntry, PeerRef, PeerRegistry};
use crate::transport::PeerTransport;
use acn_types::config::NodeConfig;
use acn_types::{record, AcnError, AcnResult, AgentRecord};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Content identifier of an address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryKey([u8; 32]);

impl DirectoryKey {
    pub fn for_address(address: &str) -> Self {
        Self(Sha256::digest(address.as_bytes()).into())
    }

    /// Key of a peer, derived from its hex peer id.
    pub fn for_peer(peer_id: &str) -> Self {
        let mut key = [0u8; 32];
        match hex::decode(peer_id) {
            Ok(bytes) if bytes.len() == 32 => key.copy_from_slice(&bytes),
            _ => key = Sha256::digest(peer_id.as_bytes()).into(),
        }
        Self(key)
    }

    /// XOR distance, compared lexicographically.
    pub fn distance(&self, other: &DirectoryKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryKey({})", &hex::encode(&self.0[..8]))
    }
}

/// Where envelopes for an address go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    LocalAgent,
    Relay,
    Delegate,
    Peer(PeerRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: AgentRecord,
    pub route: Route,
}

#[derive(Debug, Clone)]
struct ShardEntry {
    record: AgentRecord,
    peer: PeerRef,
    expires_at: Instant,
}

/// The registries the directory reads besides its own shard.
#[derive(Debug, Clone)]
pub struct Tables {
    pub peers: PeerRegistry,
    pub relay: ClientRegistry,
    pub delegate: ClientRegistry,
}

pub struct AddressDirectory {
    me: PeerRef,
    my_key: String,
    local_record: Option<AgentRecord>,
    tables: Tables,
    shard: DashMap<DirectoryKey, ShardEntry>,
    negative: DashMap<DirectoryKey, Instant>,
    transport: Arc<dyn PeerTransport>,
    entry_ttl: Duration,
    negative_ttl: Duration,
    lookup_timeout: Duration,
}

impl AddressDirectory {
    /// `me` is this peer as others reach it; `my_key` its hex public key.
    pub fn new(
        me: PeerRef,
        my_key: impl Into<String>,
        tables: Tables,
        transport: Arc<dyn PeerTransport>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            me,
            my_key: my_key.into(),
            local_record: config.agent_record.clone(),
            tables,
            shard: DashMap::new(),
            negative: DashMap::new(),
            transport,
            entry_ttl: config.directory.entry_ttl(),
            negative_ttl: config.directory.negative_ttl(),
            lookup_timeout: config.timeouts.lookup(),
        }
    }

    pub fn local_address(&self) -> Option<&str> {
        self.local_record.as_ref().map(|r| r.address.as_str())
    }

    pub fn local_record(&self) -> Option<&AgentRecord> {
        self.local_record.as_ref()
    }

    pub fn relay(&self) -> &ClientRegistry {
        &self.tables.relay
    }

    pub fn delegate(&self) -> &ClientRegistry {
        &self.tables.delegate
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.tables.peers
    }

    /// Record that `peer` represents `record.address`.
    pub fn put(&self, record: AgentRecord, peer: PeerRef) {
        let key = DirectoryKey::for_address(&record.address);
        debug!(addr = %record.address, key = %key, peer = %peer.peer_id, "ACN: directory put");
        self.negative.remove(&key);
        self.shard.insert(
            key,
            ShardEntry {
                record,
                peer,
                expires_at: Instant::now() + self.entry_ttl,
            },
        );
    }

    /// Answer from local state only.
    pub fn get(&self, address: &str) -> Option<Resolution> {
        if let Some(local) = &self.local_record {
            if local.address == address {
                return Some(Resolution {
                    record: local.clone(),
                    route: Route::LocalAgent,
                });
            }
        }
        if let Some(record) = self.tables.relay.record(address) {
            return Some(Resolution {
                record,
                route: Route::Relay,
            });
        }
        if let Some(record) = self.tables.delegate.record(address) {
            return Some(Resolution {
                record,
                route: Route::Delegate,
            });
        }
        self.shard_get(address).map(|(record, peer)| Resolution {
            record,
            route: Route::Peer(peer),
        })
    }

    /// Look up a live shard entry.
    pub fn shard_get(&self, address: &str) -> Option<(AgentRecord, PeerRef)> {
        let key = DirectoryKey::for_address(address);
        let entry = self.shard.get(&key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.shard.remove(&key);
            return None;
        }
        Some((entry.record.clone(), entry.peer.clone()))
    }

    /// Drop a shard entry so the next envelope re-resolves the address.
    pub fn invalidate(&self, address: &str) -> bool {
        let removed = self
            .shard
            .remove(&DirectoryKey::for_address(address))
            .is_some();
        if removed {
            info!(addr = %address, "ACN: directory entry invalidated");
        }
        removed
    }

    /// Answer a `LookupRequest`: the record plus the listen address of the
    /// peer representing it.
    pub fn answer_lookup(&self, address: &str) -> Option<(AgentRecord, SocketAddr)> {
        let resolution = self.get(address)?;
        let addr = match resolution.route {
            Route::Peer(peer) => peer.addr,
            Route::LocalAgent | Route::Relay | Route::Delegate => self.me.addr,
        };
        Some((resolution.record, addr))
    }

    /// Records of every address this peer itself represents.
    pub fn local_records(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.local_record.iter().cloned().collect();
        records.extend(self.tables.relay.records());
        records.extend(self.tables.delegate.records());
        records
    }

    /// Whether this peer holds any directory state beyond its own agent.
    pub fn has_state(&self) -> bool {
        !self.shard.is_empty() || !self.tables.relay.is_empty() || !self.tables.delegate.is_empty()
    }

    pub fn shard_len(&self) -> usize {
        self.shard.len()
    }

    /// Remove expired shard and negative-cache entries.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.shard.len();
        self.shard.retain(|_, e| e.expires_at > now);
        self.negative.retain(|_, expires| *expires > now);
        before - self.shard.len()
    }

    /// Connected peers ordered by XOR distance to the address key.
    pub fn closest_peers(&self, address: &str) -> Vec<PeerEntry> {
        let key = DirectoryKey::for_address(address);
        let mut peers = self.tables.peers.connected_peers();
        peers.sort_by_key(|p| key.distance(&DirectoryKey::for_peer(&p.peer_id)));
        peers
    }

    fn negatively_cached(&self, key: &DirectoryKey) -> bool {
        match self.negative.get(key) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                self.negative.remove(key);
                false
            }
            None => false,
        }
    }

    fn remember_failure(&self, key: DirectoryKey) {
        if !self.negative_ttl.is_zero() {
            self.negative.insert(key, Instant::now() + self.negative_ttl);
        }
    }

    /// Resolve `address`, asking connected peers on a local miss.
    pub async fn resolve(&self, address: &str) -> AcnResult<Resolution> {
        if let Some(found) = self.get(address) {
            return Ok(found);
        }

        let key = DirectoryKey::for_address(address);
        if self.negatively_cached(&key) {
            return Err(AcnError::UnknownAgentAddress(format!(
                "{address} (lookup failed recently)"
            )));
        }

        let peers = self.closest_peers(address);
        if peers.is_empty() {
            self.remember_failure(key);
            return Err(AcnError::UnknownAgentAddress(format!(
                "{address} (no connected peers to ask)"
            )));
        }

        debug!(op = "lookup", addr = %address, peers = peers.len(), "ACN: resolving address");
        let mut pending: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let transport = Arc::clone(&self.transport);
                let address = address.to_string();
                async move {
                    let result = transport.lookup(&peer.peer_ref(), &address).await;
                    (peer, result)
                }
            })
            .collect();

        let first_valid = async {
            while let Some((peer, result)) = pending.next().await {
                match result {
                    Ok(answer) => match record::verify(&answer.record, Some(address), None) {
                        Ok(()) if answer.record.peer_public_key.eq_ignore_ascii_case(&self.my_key) => {
                            warn!(op = "lookup", addr = %address, provider = %peer.peer_id,
                                "ACN: provider claims we represent the address, ignoring");
                        }
                        Ok(()) => return Some((peer, answer)),
                        Err(e) => {
                            warn!(op = "lookup", addr = %address, provider = %peer.peer_id, error = %e,
                                "ACN: invalid agent record from provider, trying others");
                        }
                    },
                    Err(e) => {
                        debug!(op = "lookup", addr = %address, provider = %peer.peer_id, error = %e,
                            "ACN: provider could not resolve");
                    }
                }
            }
            None
        };

        match tokio::time::timeout(self.lookup_timeout, first_valid).await {
            Ok(Some((provider, answer))) => {
                let peer = PeerRef {
                    peer_id: peer_id_for(&answer.record.peer_public_key),
                    addr: answer.peer_addr.unwrap_or(provider.address),
                };
                info!(op = "lookup", addr = %address, peer = %peer.peer_id, "ACN: address resolved");
                self.put(answer.record.clone(), peer.clone());
                Ok(Resolution {
                    record: answer.record,
                    route: Route::Peer(peer),
                })
            }
            Ok(None) => {
                self.remember_failure(key);
                Err(AcnError::UnknownAgentAddress(address.to_string()))
            }
            Err(_) => {
                warn!(op = "lookup", addr = %address, "ACN: lookup timed out");
                self.remember_failure(key);
                Err(AcnError::UnknownAgentAddress(format!(
                    "{address} (no answer within {:?})",
                    self.lookup_timeout
                )))
            }
        }
    }
}
