//! Relay and delegate client registries and the client session loop.
//!
//! Both services keep one [`ClientRegistry`] keyed by agent address. A
//! registered client owns a live link (its native-transport connection for
//! relay clients, its plain socket for delegates). When the link drops the
//! entry is kept as [`ClientState::Disconnected`] so envelopes addressed to
//! it fail with `ERROR_AGENT_NOT_READY` instead of being mis-routed, until
//! the idle sweeper removes it.

use crate::message::{AcnMessage, Payload};
use crate::router::EnvelopeRouter;
use crate::wire::{read_message, write_message, WireError};
use acn_types::{AcnError, AcnResult, AgentRecord, Status, StatusCode};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Commands queued on a client link.
const LINK_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Reached through this peer's native transport.
    Relay,
    /// Reached over a plain socket.
    Delegate,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Delegate => f.write_str("delegate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// Work for a session task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Write a message and resolve `ack` with the client's Status reply.
    Deliver {
        message: AcnMessage,
        ack: oneshot::Sender<Status>,
    },
    /// Write a reply; no answer expected.
    Reply(AcnMessage),
}

/// Sending half of a client's live connection.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: u64,
    tx: mpsc::Sender<LinkCommand>,
}

impl ClientLink {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub record: AgentRecord,
    pub state: ClientState,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Instant,
    link: Option<ClientLink>,
}

/// Whether a registration created or refreshed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Replaced,
}

/// Thread-safe table of registered clients.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    kind: ClientKind,
    capacity: Option<usize>,
    entries: Arc<RwLock<HashMap<String, ClientEntry>>>,
    next_link: Arc<AtomicU64>,
}

impl ClientRegistry {
    /// `capacity` bounds the number of distinct addresses; `None` is unbounded.
    pub fn new(kind: ClientKind, capacity: Option<usize>) -> Self {
        Self {
            kind,
            capacity,
            entries: Arc::new(RwLock::new(HashMap::new())),
            next_link: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// Allocate a link for a session about to be registered.
    pub fn open_link(&self) -> (ClientLink, mpsc::Receiver<LinkCommand>) {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        (ClientLink { id, tx }, rx)
    }

    /// Insert or refresh the entry for an already-verified record.
    ///
    /// Re-registering an address replaces the record, link and `last_seen`
    /// in place. A new address is refused once the registry is full.
    pub fn register(
        &self,
        record: AgentRecord,
        link: Option<ClientLink>,
    ) -> AcnResult<RegisterOutcome> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let address = record.address.clone();
        let state = if link.is_some() {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        };

        if let Some(entry) = entries.get_mut(&address) {
            entry.record = record;
            entry.state = state;
            entry.link = link;
            entry.last_seen = Instant::now();
            return Ok(RegisterOutcome::Replaced);
        }

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return Err(AcnError::Generic(format!(
                    "{} registry is full ({capacity} clients)",
                    self.kind
                )));
            }
        }

        entries.insert(
            address,
            ClientEntry {
                record,
                state,
                registered_at: Utc::now(),
                last_seen: Instant::now(),
                link,
            },
        );
        Ok(RegisterOutcome::Inserted)
    }

    pub fn contains(&self, address: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<ClientEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(address).cloned()
    }

    pub fn state(&self, address: &str) -> Option<ClientState> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(address).map(|e| e.state)
    }

    pub fn record(&self, address: &str) -> Option<AgentRecord> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(address).map(|e| e.record.clone())
    }

    pub fn records(&self) -> Vec<AgentRecord> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().map(|e| e.record.clone()).collect()
    }

    /// Mark the client disconnected, unless a newer link replaced `link_id`.
    pub fn mark_disconnected(&self, address: &str, link_id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(address) {
            Some(entry) if entry.link.as_ref().map(|l| l.id) == Some(link_id) => {
                entry.state = ClientState::Disconnected;
                entry.link = None;
                entry.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Mark every client disconnected (node shutdown).
    pub fn disconnect_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.state = ClientState::Disconnected;
            entry.link = None;
        }
    }

    pub fn touch(&self, address: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(address) {
            entry.last_seen = Instant::now();
        }
    }

    /// Drop disconnected entries idle for longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.state == ClientState::Disconnected && e.last_seen.elapsed() > max_idle)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &stale {
            entries.remove(addr);
        }
        stale
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|e| e.state == ClientState::Connected)
            .count()
    }

    /// Write `message` to the client's link and wait for its Status.
    ///
    /// A known client without a live link, or one that does not answer
    /// within `wait`, is `ERROR_AGENT_NOT_READY`.
    pub async fn forward(&self, address: &str, message: AcnMessage, wait: Duration) -> AcnResult<()> {
        let link = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .get(address)
                .ok_or_else(|| AcnError::UnknownAgentAddress(address.to_string()))?;
            match (&entry.state, &entry.link) {
                (ClientState::Connected, Some(link)) => link.clone(),
                _ => {
                    return Err(AcnError::AgentNotReady(format!(
                        "{} client {address} is not connected",
                        self.kind
                    )))
                }
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        link.tx
            .send(LinkCommand::Deliver {
                message,
                ack: ack_tx,
            })
            .await
            .map_err(|_| AcnError::AgentNotReady(format!("{} link to {address} closed", self.kind)))?;

        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(status)) if status.is_success() => {
                self.touch(address);
                Ok(())
            }
            Ok(Ok(status)) => Err(AcnError::from_status(&status)
                .unwrap_or_else(|| AcnError::Generic("unexpected status".into()))),
            Ok(Err(_)) => Err(AcnError::AgentNotReady(format!(
                "{} link to {address} dropped before acknowledging",
                self.kind
            ))),
            Err(_) => Err(AcnError::AgentNotReady(format!(
                "{} client {address} did not acknowledge within {wait:?}",
                self.kind
            ))),
        }
    }
}

/// Everything a session needs besides its stream.
pub struct ClientSession {
    pub address: String,
    pub link: ClientLink,
    pub commands: mpsc::Receiver<LinkCommand>,
    pub registry: ClientRegistry,
    pub router: Arc<EnvelopeRouter>,
    pub max_frame: u32,
    pub shutdown: watch::Receiver<bool>,
}

impl ClientSession {
    /// Serve a registered client until its stream closes or the node stops.
    ///
    /// Envelopes the client sends are routed one at a time, so replies come
    /// back in the order the envelopes arrived.
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ClientSession {
            address,
            link,
            mut commands,
            registry,
            router,
            max_frame,
            mut shutdown,
        } = self;
        let kind = registry.kind();
        let (mut reader, mut writer) = tokio::io::split(stream);

        // Frames are read on their own task: a half-read frame must not be
        // lost when another select branch wins.
        let (frame_tx, mut frames) = mpsc::channel::<Result<AcnMessage, AcnError>>(LINK_BUFFER);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader, max_frame).await {
                    Ok(msg) => {
                        if frame_tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(WireError::Protocol(e)) => {
                        if frame_tx.send(Err(e)).await.is_err() {
                            break;
                        }
                    }
                    Err(WireError::ConnectionClosed) => break,
                    Err(e) => {
                        debug!(error = %e, "ACN: client stream read failed");
                        break;
                    }
                }
            }
        });

        let (route_tx, mut route_rx) = mpsc::channel::<(Vec<u8>, AgentRecord)>(LINK_BUFFER);
        let route_task = {
            let router = Arc::clone(&router);
            let address = address.clone();
            let reply = link.clone();
            tokio::spawn(async move {
                while let Some((envelope, record)) = route_rx.recv().await {
                    let status = router
                        .route_from_client(kind, &address, &envelope, record)
                        .await;
                    if reply
                        .tx
                        .send(LinkCommand::Reply(AcnMessage::status(status)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let mut pending: VecDeque<oneshot::Sender<Status>> = VecDeque::new();
        info!(kind = %kind, addr = %address, "ACN: client session started");

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let msg = match frame {
                        None => break,
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!(kind = %kind, addr = %address, error = %e, "ACN: undecodable frame from client");
                            if write_message(&mut writer, &AcnMessage::status(e.to_status())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };
                    registry.touch(&address);
                    match msg.payload {
                        Payload::Status(status) => match pending.pop_front() {
                            Some(ack) => {
                                let _ = ack.send(status);
                            }
                            None => debug!(addr = %address, "ACN: unsolicited status from client"),
                        },
                        Payload::AeaEnvelope { envelope, record } => {
                            if route_tx.send((envelope, record)).await.is_err() {
                                break;
                            }
                        }
                        other => {
                            let status = Status::error(
                                StatusCode::ErrorUnexpectedPayload,
                                format!("{} not accepted on a {kind} session", other.kind()),
                            );
                            if write_message(&mut writer, &AcnMessage::status(status)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                command = commands.recv() => match command {
                    None => break,
                    Some(LinkCommand::Deliver { message, ack }) => {
                        match write_message(&mut writer, &message).await {
                            Ok(()) => pending.push_back(ack),
                            Err(e) => {
                                let _ = ack.send(Status::error(StatusCode::ErrorAgentNotReady, e.to_string()));
                                break;
                            }
                        }
                    }
                    Some(LinkCommand::Reply(message)) => {
                        if write_message(&mut writer, &message).await.is_err() {
                            break;
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        registry.mark_disconnected(&address, link.id);
        reader_task.abort();
        route_task.abort();
        info!(kind = %kind, addr = %address, "ACN: client session ended");
    }
}
