//! Routing counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the router and the client services.
#[derive(Debug, Default)]
pub struct NodeStats {
    routed: AtomicU64,
    delivered_local: AtomicU64,
    delivered_clients: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    lookups_served: AtomicU64,
    registrations: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
///
/// The gauges at the end are zero here and filled in by
/// `PeerNode::stats`, which owns the tables they count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub routed: u64,
    pub delivered_local: u64,
    pub delivered_clients: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub lookups_served: u64,
    pub registrations: u64,
    pub connected_peers: usize,
    pub relay_clients: usize,
    pub delegate_clients: usize,
    pub directory_entries: usize,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered_local(&self) {
        self.delivered_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered_client(&self) {
        self.delivered_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_served(&self) {
        self.lookups_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            delivered_clients: self.delivered_clients.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lookups_served: self.lookups_served.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            ..StatsSnapshot::default()
        }
    }
}
