//! The peer node: composes the directory, registries, bridge and router
//! behind the channel listeners.
//!
//! [`PeerNode::start`] binds every listener, restores persisted relay
//! records, joins the bootstrap peers and only then opens the steady-state
//! channels. Until it is ready, requests on the address, envelope and
//! register channels are answered with an `ERROR_GENERIC` status.

use crate::bootstrap::{self, Announcements};
use crate::bridge::LocalAgentBridge;
use crate::clients::{ClientKind, ClientRegistry};
use crate::directory::{AddressDirectory, Tables};
use crate::handshake::{HandshakeOptions, NodeIdentity};
use crate::registry::{PeerEntry, PeerRef, PeerRegistry, PeerState};
use crate::retry::RetryConfig;
use crate::router::EnvelopeRouter;
use crate::stats::{NodeStats, StatsSnapshot};
use crate::store::RecordStore;
use crate::transport::{PeerTransport, TcpTransport};
use crate::wire::WireError;
use acn_types::{record, AcnError, AcnResult, NodeConfig};
use chrono::Utc;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on the sweeper period.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that stop a peer from starting.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] AcnError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
}

/// A running ACN peer.
pub struct PeerNode {
    pub(crate) config: NodeConfig,
    pub(crate) identity: Arc<NodeIdentity>,
    local_addr: SocketAddr,
    public_addr: SocketAddr,
    delegate_addr: Option<SocketAddr>,
    agent_bridge_addr: Option<SocketAddr>,
    pub(crate) peers: PeerRegistry,
    pub(crate) directory: Arc<AddressDirectory>,
    pub(crate) router: Arc<EnvelopeRouter>,
    pub(crate) bridge: Arc<LocalAgentBridge>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) announced: Announcements,
    pub(crate) store: Option<RecordStore>,
    pub(crate) stats: Arc<NodeStats>,
    ready: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Bind, bootstrap and start serving.
    ///
    /// Fails when a listener cannot be bound, the configuration is invalid,
    /// or no bootstrap peer could be joined and the peer has neither a local
    /// agent nor directory state of its own to serve.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let identity = Arc::new(NodeIdentity::new(record::parse_signing_key(&config.private_key)?));

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let public_addr = match config.public_addr {
            Some(addr) => addr,
            None if local_addr.ip().is_unspecified() => {
                let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local_addr.port());
                warn!(bound = %local_addr, advertised = %addr, "ACN: no public_addr configured, advertising loopback");
                addr
            }
            None => local_addr,
        };
        let delegate_listener = match config.delegate_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let bridge_listener = match config.agent_bridge_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let delegate_addr = delegate_listener.as_ref().map(|l| l.local_addr()).transpose()?;
        let agent_bridge_addr = bridge_listener.as_ref().map(|l| l.local_addr()).transpose()?;

        let handshake = HandshakeOptions {
            network_secret: config.network_secret.clone(),
            listen_addr: Some(public_addr),
        };
        let transport: Arc<dyn PeerTransport> = Arc::new(TcpTransport::new(
            Arc::clone(&identity),
            handshake,
            config.timeouts.clone(),
            config.max_frame_size,
        ));

        let peers = PeerRegistry::new();
        let tables = Tables {
            peers: peers.clone(),
            relay: ClientRegistry::new(ClientKind::Relay, Some(config.relay.capacity)),
            delegate: ClientRegistry::new(ClientKind::Delegate, None),
        };
        let me = PeerRef {
            peer_id: identity.peer_id().to_string(),
            addr: public_addr,
        };
        let directory = Arc::new(AddressDirectory::new(
            me,
            identity.public_key(),
            tables,
            Arc::clone(&transport),
            &config,
        ));
        let bridge = Arc::new(LocalAgentBridge::new(
            config.agent_record.as_ref().map(|r| r.address.clone()),
        ));
        let stats = Arc::new(NodeStats::new());
        let router = Arc::new(EnvelopeRouter::new(
            identity.public_key(),
            Arc::clone(&directory),
            Arc::clone(&bridge),
            Arc::clone(&transport),
            Arc::clone(&stats),
            config.timeouts.clone(),
        ));

        let store = match &config.records_storage_path {
            Some(path) => {
                let (store, restored) = RecordStore::open(path)?;
                restore_relay_records(directory.relay(), identity.public_key(), restored);
                Some(store)
            }
            None => None,
        };

        let (shutdown, _) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            identity,
            local_addr,
            public_addr,
            delegate_addr,
            agent_bridge_addr,
            peers,
            directory,
            router,
            bridge,
            transport,
            announced: Announcements::new(),
            store,
            stats,
            ready: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            addr = %local_addr,
            public = %public_addr,
            peer = %node.identity.peer_id(),
            "ACN: peer listening"
        );

        let mut tasks = vec![node.spawn_listener("peer", listener, |node, stream, addr| async move {
            node.handle_inbound(stream, addr).await
        })];
        if let Some(listener) = delegate_listener {
            info!(addr = ?delegate_addr, "ACN: delegate service listening");
            tasks.push(node.spawn_listener("delegate", listener, |node, stream, addr| async move {
                debug!(client = %addr, "ACN: delegate connection");
                node.accept_client(ClientKind::Delegate, stream).await
            }));
        }
        if let Some(listener) = bridge_listener {
            info!(addr = ?agent_bridge_addr, "ACN: local agent bridge listening");
            tasks.push(node.spawn_listener("bridge", listener, |node, stream, addr| async move {
                if let Err(e) = node.attach_agent(stream) {
                    warn!(client = %addr, error = %e, "ACN: refused local agent connection");
                }
            }));
        }
        tasks.push(node.spawn_sweeper());
        node.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        if let Err(e) = node.run_bootstrap().await {
            node.shutdown().await;
            return Err(e);
        }

        node.ready.store(true, Ordering::SeqCst);
        info!(peer = %node.identity.peer_id(), "ACN: peer ready");
        Ok(node)
    }

    async fn run_bootstrap(&self) -> Result<(), NodeError> {
        let records = self.directory.local_records();
        if self.config.bootstrap_peers.is_empty() {
            return Ok(());
        }
        let retry = RetryConfig::attempts(self.config.bootstrap_attempts);
        let report = bootstrap::bootstrap(
            self.transport.as_ref(),
            &self.peers,
            &self.announced,
            &self.config.bootstrap_peers,
            self.identity.peer_id(),
            &records,
            &retry,
        )
        .await;

        let owns_addresses = self.directory.has_state() || self.directory.local_record().is_some();
        if !report.any_joined() && !owns_addresses {
            let reasons: Vec<String> = report
                .failed
                .iter()
                .map(|(addr, e)| format!("{addr}: {e}"))
                .collect();
            error!(failed = report.failed.len(), "ACN: no bootstrap peer reachable");
            return Err(NodeError::Bootstrap(reasons.join("; ")));
        }
        info!(
            joined = report.joined.len(),
            failed = report.failed.len(),
            "ACN: bootstrap complete"
        );
        Ok(())
    }

    fn spawn_listener<F, Fut>(self: &Arc<Self>, name: &'static str, listener: TcpListener, handler: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>, TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(listener = name, remote = %addr, "ACN: accepted connection");
                            tokio::spawn(handler(Arc::clone(&node), stream, addr));
                        }
                        Err(e) => {
                            error!(listener = name, error = %e, "ACN: accept error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(listener = name, "ACN: listener stopped");
        })
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let idle = self.config.timeouts.client_idle();
        let period = idle.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.sweep(idle),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Remove idle disconnected clients and expired directory entries.
    pub fn sweep(&self, max_idle: Duration) {
        let relay = self.directory.relay().sweep_idle(max_idle);
        let delegate = self.directory.delegate().sweep_idle(max_idle);
        for address in relay.iter().chain(delegate.iter()) {
            self.announced.forget_address(address);
        }
        let expired = self.directory.sweep_expired();
        if !relay.is_empty() || !delegate.is_empty() || expired > 0 {
            info!(
                relay = relay.len(),
                delegate = delegate.len(),
                directory = expired,
                "ACN: swept idle entries"
            );
        }
    }

    /// Join another peer after startup.
    pub async fn join(&self, addr: SocketAddr) -> Result<PeerRef, WireError> {
        let records = self.directory.local_records();
        let remote = self.transport.join(addr, &records).await?;
        self.peers.add_peer(PeerEntry {
            peer_id: remote.peer_id.clone(),
            public_key: remote.public_key,
            address: addr,
            state: PeerState::Connected,
            connected_at: Utc::now(),
        });
        for record in &records {
            self.announced.mark(&record.address, &remote.peer_id);
        }
        info!(addr = %addr, peer = %remote.peer_id, "ACN: joined peer");
        Ok(PeerRef {
            peer_id: remote.peer_id,
            addr,
        })
    }

    /// Attach the local agent over an already open stream.
    pub fn attach_agent<S>(&self, stream: S) -> AcnResult<JoinHandle<()>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.bridge.attach(stream, Arc::clone(&self.router))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address other peers use to reach this one.
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn delegate_addr(&self) -> Option<SocketAddr> {
        self.delegate_addr
    }

    pub fn agent_bridge_addr(&self) -> Option<SocketAddr> {
        self.agent_bridge_addr
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    pub fn public_key(&self) -> &str {
        self.identity.public_key()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn directory(&self) -> &AddressDirectory {
        &self.directory
    }

    pub fn relay_clients(&self) -> &ClientRegistry {
        self.directory.relay()
    }

    pub fn delegate_clients(&self) -> &ClientRegistry {
        self.directory.delegate()
    }

    pub fn router(&self) -> &EnvelopeRouter {
        &self.router
    }

    pub fn bridge(&self) -> &LocalAgentBridge {
        &self.bridge
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected_peers: self.peers.connected_count(),
            relay_clients: self.directory.relay().len(),
            delegate_clients: self.directory.delegate().len(),
            directory_entries: self.directory.shard_len(),
            ..self.stats.snapshot()
        }
    }

    /// Stop listeners, disconnect clients and flush the record store.
    ///
    /// In-flight requests on already accepted connections run to completion
    /// or fail with a closed link; no registration is left half applied.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(peer = %self.identity.peer_id(), "ACN: shutting down");
        self.ready.store(false, Ordering::SeqCst);
        self.directory.relay().disconnect_all();
        self.directory.delegate().disconnect_all();
        self.bridge.close();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("ACN: background task did not stop in time, aborting");
                task.abort();
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.sync() {
                warn!(path = %store.path().display(), error = %e, "ACN: failed to flush record store");
            }
        }
        info!(peer = %self.identity.peer_id(), "ACN: stopped");
    }
}

/// Reload persisted relay records as disconnected entries.
fn restore_relay_records(relay: &ClientRegistry, peer_key: &str, records: Vec<acn_types::AgentRecord>) {
    let mut restored = 0;
    for record in records {
        if let Err(e) = record::verify(&record, Some(&record.address), Some(peer_key)) {
            warn!(addr = %record.address, error = %e, "ACN: dropping stored relay record");
            continue;
        }
        match relay.register(record, None) {
            Ok(_) => restored += 1,
            Err(e) => warn!(error = %e, "ACN: cannot restore relay record"),
        }
    }
    if restored > 0 {
        info!(count = restored, "ACN: restored relay records");
    }
}
