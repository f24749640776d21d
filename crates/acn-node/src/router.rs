//! Envelope router: the per-envelope decision of where an envelope goes.
//!
//! Every envelope enters through one of three doors, each with its own
//! provenance rule:
//!
//! - [`EnvelopeRouter::route_from_local_agent`]: the sender must be the local
//!   agent, otherwise the envelope is dropped without reply.
//! - [`EnvelopeRouter::route_from_client`]: the sender must be the address
//!   the relay or delegate client registered, and its record must be
//!   countersigned by this peer.
//! - [`EnvelopeRouter::route_from_peer`]: the sender's record must be
//!   countersigned by the authenticated peer on the link. Peer envelopes are
//!   terminal: they are delivered to the local agent or a client of this
//!   peer and never forwarded again.
//!
//! After the provenance check the target is looked up in the local tables
//! ([`EnvelopeRouter::decide`]) and, failing that, resolved through the
//! address directory. Each envelope is forwarded at most once.

use crate::bridge::LocalAgentBridge;
use crate::clients::ClientKind;
use crate::directory::{AddressDirectory, Route};
use crate::message::{AcnMessage, Payload};
use crate::registry::PeerRef;
use crate::stats::NodeStats;
use crate::transport::PeerTransport;
use crate::wire::WireError;
use acn_types::config::TimeoutConfig;
use acn_types::{record, AcnError, AcnResult, AgentRecord, Envelope, Status, StatusCode};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the local tables send an envelope for a target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    DeliverLocal,
    Delegate(String),
    Relay(String),
    Forward(PeerRef),
    /// Nothing local knows the target; ask the directory.
    Resolve(String),
}

/// Which door an envelope came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    LocalAgent,
    Client(ClientKind),
    Peer,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalAgent => f.write_str("local-agent"),
            Self::Client(kind) => write!(f, "{kind}-client"),
            Self::Peer => f.write_str("peer"),
        }
    }
}

pub struct EnvelopeRouter {
    peer_key: String,
    directory: Arc<AddressDirectory>,
    bridge: Arc<LocalAgentBridge>,
    transport: Arc<dyn PeerTransport>,
    stats: Arc<NodeStats>,
    timeouts: TimeoutConfig,
}

impl EnvelopeRouter {
    /// `peer_key` is this peer's hex public key.
    pub fn new(
        peer_key: impl Into<String>,
        directory: Arc<AddressDirectory>,
        bridge: Arc<LocalAgentBridge>,
        transport: Arc<dyn PeerTransport>,
        stats: Arc<NodeStats>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            peer_key: peer_key.into(),
            directory,
            bridge,
            transport,
            stats,
            timeouts,
        }
    }

    /// Decide from local state alone. Pure with respect to the tables.
    pub fn decide(&self, target: &str) -> RouteDecision {
        if self.directory.local_address() == Some(target) {
            return RouteDecision::DeliverLocal;
        }
        if self.directory.delegate().contains(target) {
            return RouteDecision::Delegate(target.to_string());
        }
        if self.directory.relay().contains(target) {
            return RouteDecision::Relay(target.to_string());
        }
        match self.directory.shard_get(target) {
            Some((_, peer)) => RouteDecision::Forward(peer),
            None => RouteDecision::Resolve(target.to_string()),
        }
    }

    /// Route an envelope received on the envelope channel from the peer
    /// whose proven key is `link_key`.
    pub async fn route_from_peer(&self, envelope: &[u8], record: AgentRecord, link_key: &str) -> Status {
        self.stats.record_routed();
        let origin = Origin::Peer;
        let decoded = match Envelope::decode(envelope) {
            Ok(e) => e,
            Err(e) => return self.reject(origin, None, e),
        };
        if let Err(e) = record::verify(&record, Some(&decoded.sender), Some(link_key)) {
            return self.reject(origin, Some(&decoded), e);
        }
        self.finish(origin, &decoded, envelope.to_vec(), record).await
    }

    /// Route an envelope sent by a registered relay or delegate client.
    pub async fn route_from_client(
        &self,
        kind: ClientKind,
        registered_address: &str,
        envelope: &[u8],
        record: AgentRecord,
    ) -> Status {
        self.stats.record_routed();
        let origin = Origin::Client(kind);
        let decoded = match Envelope::decode(envelope) {
            Ok(e) => e,
            Err(e) => return self.reject(origin, None, e),
        };
        if decoded.sender != registered_address {
            let err = AcnError::WrongAgentAddress {
                expected: registered_address.to_string(),
                found: decoded.sender.clone(),
            };
            return self.reject(origin, Some(&decoded), err);
        }
        if let Err(e) = record::verify(&record, Some(&decoded.sender), Some(&self.peer_key)) {
            return self.reject(origin, Some(&decoded), e);
        }
        self.finish(origin, &decoded, envelope.to_vec(), record).await
    }

    /// Route an envelope written by the local agent.
    ///
    /// Returns `None` when the envelope is dropped for bad provenance: the
    /// local agent gets no reply in that case.
    pub async fn route_from_local_agent(&self, envelope: Envelope) -> Option<Status> {
        let origin = Origin::LocalAgent;
        let Some(local) = self.directory.local_record().cloned() else {
            warn!(op = "route", origin = %origin, "ACN: envelope from local agent but none is configured, dropped");
            return None;
        };
        if envelope.sender != local.address {
            warn!(
                op = "route",
                origin = %origin,
                sender = %envelope.sender,
                expected = %local.address,
                "ACN: invalid provenance, envelope dropped"
            );
            return None;
        }

        self.stats.record_routed();
        if let Err(e) = record::verify(&local, Some(&envelope.sender), Some(&self.peer_key)) {
            return Some(self.reject(origin, Some(&envelope), e));
        }
        let encoded = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => return Some(self.reject(origin, Some(&envelope), e)),
        };
        Some(self.finish(origin, &envelope, encoded, local).await)
    }

    async fn finish(&self, origin: Origin, envelope: &Envelope, encoded: Vec<u8>, record: AgentRecord) -> Status {
        match self.dispatch(origin, envelope, encoded, record).await {
            Ok(()) => {
                debug!(op = "route", origin = %origin, to = %envelope.to, "ACN: envelope routed");
                Status::success()
            }
            Err(e) => self.reject(origin, Some(envelope), e),
        }
    }

    fn reject(&self, origin: Origin, envelope: Option<&Envelope>, err: AcnError) -> Status {
        self.stats.record_failed();
        match envelope {
            Some(env) => warn!(
                op = "route",
                origin = %origin,
                sender = %env.sender,
                to = %env.to,
                code = %err.status_code(),
                error = %err,
                "ACN: envelope rejected"
            ),
            None => warn!(op = "route", origin = %origin, code = %err.status_code(), error = %err, "ACN: envelope rejected"),
        }
        err.to_status()
    }

    async fn dispatch(&self, origin: Origin, envelope: &Envelope, encoded: Vec<u8>, record: AgentRecord) -> AcnResult<()> {
        let message = || {
            AcnMessage::new(Payload::AeaEnvelope {
                envelope: encoded.clone(),
                record: record.clone(),
            })
        };

        match self.decide(&envelope.to) {
            RouteDecision::DeliverLocal => self.deliver_local(envelope).await,
            RouteDecision::Delegate(addr) => self.deliver_client(ClientKind::Delegate, &addr, message()).await,
            RouteDecision::Relay(addr) => self.deliver_client(ClientKind::Relay, &addr, message()).await,
            RouteDecision::Forward(_) | RouteDecision::Resolve(_) if origin == Origin::Peer => {
                Err(AcnError::UnknownAgentAddress(format!(
                    "{} is not represented by this peer",
                    envelope.to
                )))
            }
            RouteDecision::Forward(peer) => self.forward_to_peer(&envelope.to, &peer, message()).await,
            RouteDecision::Resolve(target) => {
                let resolution = self.directory.resolve(&target).await?;
                match resolution.route {
                    Route::Peer(peer) => self.forward_to_peer(&target, &peer, message()).await,
                    // Registered while we were resolving.
                    Route::LocalAgent => self.deliver_local(envelope).await,
                    Route::Delegate => self.deliver_client(ClientKind::Delegate, &target, message()).await,
                    Route::Relay => self.deliver_client(ClientKind::Relay, &target, message()).await,
                }
            }
        }
    }

    async fn deliver_local(&self, envelope: &Envelope) -> AcnResult<()> {
        self.bridge.deliver(envelope, self.timeouts.agent_ready()).await?;
        self.stats.record_delivered_local();
        info!(op = "deliver", to = %envelope.to, sender = %envelope.sender, "ACN: delivered to local agent");
        Ok(())
    }

    async fn deliver_client(&self, kind: ClientKind, address: &str, message: AcnMessage) -> AcnResult<()> {
        let registry = match kind {
            ClientKind::Relay => self.directory.relay(),
            ClientKind::Delegate => self.directory.delegate(),
        };
        registry.forward(address, message, self.timeouts.agent_ready()).await?;
        self.stats.record_delivered_client();
        debug!(op = "deliver", kind = %kind, to = %address, "ACN: delivered to client");
        Ok(())
    }

    /// Single forward attempt. A failed attempt drops the directory entry so
    /// the next envelope re-resolves the target, unless the peer accepted the
    /// envelope and only its status was late.
    async fn forward_to_peer(&self, target: &str, peer: &PeerRef, message: AcnMessage) -> AcnResult<()> {
        match self.transport.forward(peer, message).await {
            Ok(status) if status.is_success() => {
                self.stats.record_forwarded();
                debug!(op = "forward", to = %target, peer = %peer.peer_id, "ACN: envelope forwarded");
                Ok(())
            }
            Ok(status) => {
                if status.status_code == StatusCode::ErrorUnknownAgentAddress {
                    self.directory.invalidate(target);
                }
                Err(AcnError::from_status(&status)
                    .unwrap_or_else(|| AcnError::Generic("remote peer returned an empty status".into())))
            }
            Err(e) => {
                warn!(op = "forward", to = %target, peer = %peer.peer_id, error = %e, "ACN: forward failed");
                // A peer that took the envelope but answered late still represents the target.
                if !matches!(e, WireError::NoReply(_)) {
                    self.directory.invalidate(target);
                }
                Err(AcnError::from_status(&e.to_status())
                    .unwrap_or_else(|| AcnError::Generic(e.to_string())))
            }
        }
    }
}
