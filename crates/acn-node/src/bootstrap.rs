//! Bootstrap/join and address announcements.
//!
//! At startup a peer joins every configured bootstrap peer: it opens the
//! notify channel, waits for the peer's acknowledgement that it has been
//! inserted, then announces each locally owned address. Bootstrap peers are
//! joined concurrently and a failure is reported, not fatal; the caller
//! decides whether the overall result is acceptable.
//!
//! [`Announcements`] remembers which peer has heard of which address so a
//! re-registration only announces to peers that joined since.

use crate::registry::{PeerEntry, PeerRef, PeerRegistry, PeerState};
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use crate::transport::PeerTransport;
use crate::wire::WireError;
use acn_types::AgentRecord;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Which peers each address has been announced to.
#[derive(Debug, Default)]
pub struct Announcements {
    by_address: DashMap<String, HashSet<String>>,
}

impl Announcements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, address: &str, peer_id: &str) {
        self.by_address
            .entry(address.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }

    pub fn is_announced(&self, address: &str, peer_id: &str) -> bool {
        self.by_address
            .get(address)
            .map(|peers| peers.contains(peer_id))
            .unwrap_or(false)
    }

    /// Forget a peer, e.g. after it rejoined and lost its directory.
    pub fn forget_peer(&self, peer_id: &str) {
        for mut peers in self.by_address.iter_mut() {
            peers.remove(peer_id);
        }
    }

    pub fn forget_address(&self, address: &str) {
        self.by_address.remove(address);
    }
}

/// Announce `records` to every connected peer that has not heard of them.
///
/// Returns the number of peers that accepted an announcement. Peers that
/// cannot be reached are marked disconnected.
pub async fn announce_records(
    transport: &dyn PeerTransport,
    peers: &PeerRegistry,
    announced: &Announcements,
    records: &[AgentRecord],
) -> usize {
    let targets: Vec<(PeerEntry, Vec<AgentRecord>)> = peers
        .connected_peers()
        .into_iter()
        .filter_map(|peer| {
            let pending: Vec<AgentRecord> = records
                .iter()
                .filter(|r| !announced.is_announced(&r.address, &peer.peer_id))
                .cloned()
                .collect();
            (!pending.is_empty()).then_some((peer, pending))
        })
        .collect();

    let results = join_all(targets.into_iter().map(|(peer, pending)| async move {
        let result = transport.announce(&peer.peer_ref(), &pending).await;
        (peer, pending, result)
    }))
    .await;

    let mut accepted = 0;
    for (peer, pending, result) in results {
        match result {
            Ok(()) => {
                for record in &pending {
                    announced.mark(&record.address, &peer.peer_id);
                }
                debug!(peer = %peer.peer_id, count = pending.len(), "ACN: addresses announced");
                accepted += 1;
            }
            Err(e) => {
                warn!(peer = %peer.peer_id, error = %e, "ACN: announcement failed, marking peer disconnected");
                peers.mark_disconnected(&peer.peer_id);
            }
        }
    }
    accepted
}

/// Outcome of [`bootstrap`].
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub joined: Vec<PeerRef>,
    pub failed: Vec<(SocketAddr, String)>,
}

impl BootstrapReport {
    pub fn any_joined(&self) -> bool {
        !self.joined.is_empty()
    }
}

fn worth_retrying(err: &WireError) -> bool {
    matches!(
        err,
        WireError::Io(_) | WireError::Timeout(_) | WireError::NoReply(_) | WireError::ConnectionClosed
    )
}

/// Join each bootstrap peer and announce `records` to it.
///
/// `own_peer_id` guards against a configuration that lists this peer itself.
pub async fn bootstrap(
    transport: &dyn PeerTransport,
    peers: &PeerRegistry,
    announced: &Announcements,
    bootstrap_addrs: &[SocketAddr],
    own_peer_id: &str,
    records: &[AgentRecord],
    retry: &RetryConfig,
) -> BootstrapReport {
    let attempts = bootstrap_addrs.iter().map(|&addr| async move {
        let outcome = retry_async(retry, || transport.join(addr, records), worth_retrying).await;
        (addr, outcome)
    });

    let mut report = BootstrapReport::default();
    for (addr, outcome) in join_all(attempts).await {
        match outcome {
            RetryOutcome::Success { result: remote, attempts } => {
                if remote.peer_id == own_peer_id {
                    debug!(addr = %addr, "ACN: bootstrap address is this peer, skipped");
                    continue;
                }
                peers.add_peer(PeerEntry {
                    peer_id: remote.peer_id.clone(),
                    public_key: remote.public_key.clone(),
                    address: addr,
                    state: PeerState::Connected,
                    connected_at: Utc::now(),
                });
                for record in records {
                    announced.mark(&record.address, &remote.peer_id);
                }
                info!(addr = %addr, peer = %remote.peer_id, attempts, "ACN: joined bootstrap peer");
                report.joined.push(PeerRef {
                    peer_id: remote.peer_id,
                    addr,
                });
            }
            RetryOutcome::Exhausted { last_error, attempts } => {
                warn!(addr = %addr, attempts, error = %last_error, "ACN: bootstrap peer unreachable");
                report.failed.push((addr, last_error.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{peer_id_for, RemotePeer};
    use crate::message::AcnMessage;
    use crate::transport::LookupAnswer;
    use acn_types::record::generate_signing_key;
    use acn_types::Status;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Joins succeed on port 9001 only after `fail_first` failures.
    struct FlakyTransport {
        fail_first: usize,
        joins: AtomicUsize,
        announced: Mutex<Vec<(String, usize)>>,
        refuse_announce: bool,
    }

    impl FlakyTransport {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                joins: AtomicUsize::new(0),
                announced: Mutex::new(Vec::new()),
                refuse_announce: false,
            }
        }
    }

    #[async_trait]
    impl PeerTransport for FlakyTransport {
        async fn join(&self, addr: SocketAddr, _: &[AgentRecord]) -> Result<RemotePeer, WireError> {
            if addr.port() != 9001 {
                return Err(WireError::Rejected(Status::error(
                    acn_types::StatusCode::ErrorGeneric,
                    "go away",
                )));
            }
            if self.joins.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(WireError::ConnectionClosed);
            }
            Ok(RemotePeer {
                public_key: "aa".into(),
                peer_id: peer_id_for("aa"),
                listen_addr: Some(addr),
            })
        }
        async fn announce(&self, peer: &PeerRef, records: &[AgentRecord]) -> Result<(), WireError> {
            if self.refuse_announce {
                return Err(WireError::ConnectionClosed);
            }
            self.announced
                .lock()
                .unwrap()
                .push((peer.peer_id.clone(), records.len()));
            Ok(())
        }
        async fn lookup(&self, _: &PeerRef, _: &str) -> Result<LookupAnswer, WireError> {
            Err(WireError::ConnectionClosed)
        }
        async fn forward(&self, _: &PeerRef, _: AcnMessage) -> Result<Status, WireError> {
            Ok(Status::success())
        }
    }

    fn record() -> AgentRecord {
        AgentRecord::issue(
            "acn",
            &generate_signing_key(),
            "aa",
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_partial_bootstrap_succeeds() {
        let transport = FlakyTransport::new(1);
        let peers = PeerRegistry::new();
        let announced = Announcements::new();
        let records = vec![record()];

        let report = bootstrap(
            &transport,
            &peers,
            &announced,
            &[addr(9001), addr(9002)],
            "me",
            &records,
            &fast_retry(3),
        )
        .await;

        assert_eq!(report.joined.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, addr(9002));
        assert_eq!(peers.connected_count(), 1);
        assert!(announced.is_announced(&records[0].address, &peer_id_for("aa")));
        // One failure, then success; the rejected peer is not retried.
        assert_eq!(transport.joins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_skips_self() {
        let transport = FlakyTransport::new(0);
        let peers = PeerRegistry::new();
        let report = bootstrap(
            &transport,
            &peers,
            &Announcements::new(),
            &[addr(9001)],
            &peer_id_for("aa"),
            &[],
            &fast_retry(1),
        )
        .await;
        assert!(!report.any_joined());
        assert_eq!(peers.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_announce_only_new_addresses() {
        let transport = FlakyTransport::new(0);
        let peers = PeerRegistry::new();
        let announced = Announcements::new();
        bootstrap(&transport, &peers, &announced, &[addr(9001)], "me", &[], &fast_retry(1)).await;

        let r = record();
        assert_eq!(announce_records(&transport, &peers, &announced, &[r.clone()]).await, 1);
        // Second time there is nothing new to say.
        assert_eq!(announce_records(&transport, &peers, &announced, &[r.clone()]).await, 0);
        assert_eq!(transport.announced.lock().unwrap().len(), 1);

        announced.forget_peer(&peer_id_for("aa"));
        assert_eq!(announce_records(&transport, &peers, &announced, &[r]).await, 1);
    }

    #[tokio::test]
    async fn test_failed_announce_marks_peer_disconnected() {
        let mut transport = FlakyTransport::new(0);
        let peers = PeerRegistry::new();
        let announced = Announcements::new();
        bootstrap(&transport, &peers, &announced, &[addr(9001)], "me", &[], &fast_retry(1)).await;
        transport.refuse_announce = true;

        assert_eq!(announce_records(&transport, &peers, &announced, &[record()]).await, 0);
        assert_eq!(peers.connected_count(), 0);
    }
}
