//! Outbound requests to other peers.
//!
//! [`PeerTransport`] is the seam between the routing logic and the network:
//! the directory and router only ever talk to other peers through it. The
//! TCP implementation opens a fresh authenticated connection per request on
//! the channel the request belongs to.

use crate::handshake::{self, Channel, HandshakeOptions, NodeIdentity, RemotePeer};
use crate::message::{AcnMessage, Payload};
use crate::registry::PeerRef;
use crate::wire::{read_message, write_message, WireError};
use acn_types::config::TimeoutConfig;
use acn_types::{AcnError, AgentRecord, Status};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A successful lookup answer.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupAnswer {
    pub record: AgentRecord,
    /// Listen address of the representing peer, when the answerer knows it.
    pub peer_addr: Option<SocketAddr>,
}

/// Requests a peer node sends to other peers.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Join the peer at `addr`: wait until it has inserted us, then announce
    /// `records`. Returns the peer's proven identity.
    async fn join(&self, addr: SocketAddr, records: &[AgentRecord]) -> Result<RemotePeer, WireError>;

    /// Announce `records` to an already joined peer.
    async fn announce(&self, peer: &PeerRef, records: &[AgentRecord]) -> Result<(), WireError>;

    /// Ask `peer` which peer represents `address`.
    async fn lookup(&self, peer: &PeerRef, address: &str) -> Result<LookupAnswer, WireError>;

    /// Send an `AeaEnvelope` message and return the peer's Status.
    async fn forward(&self, peer: &PeerRef, message: AcnMessage) -> Result<Status, WireError>;
}

/// [`PeerTransport`] over TCP with the ACN handshake.
pub struct TcpTransport {
    identity: Arc<NodeIdentity>,
    options: HandshakeOptions,
    timeouts: TimeoutConfig,
    max_frame: u32,
}

impl TcpTransport {
    pub fn new(
        identity: Arc<NodeIdentity>,
        options: HandshakeOptions,
        timeouts: TimeoutConfig,
        max_frame: u32,
    ) -> Self {
        Self {
            identity,
            options,
            timeouts,
            max_frame,
        }
    }

    /// Connect and authenticate on `channel`, bounded by the stream timeout.
    async fn open(&self, addr: SocketAddr, channel: Channel) -> Result<(TcpStream, RemotePeer), WireError> {
        let connect = async {
            let mut stream = TcpStream::connect(addr).await?;
            let remote =
                handshake::initiate(&mut stream, &self.identity, channel, &self.options).await?;
            Ok::<_, WireError>((stream, remote))
        };
        match tokio::time::timeout(self.timeouts.new_stream(), connect).await {
            Ok(result) => result,
            Err(_) => Err(WireError::Timeout("opening stream")),
        }
    }

    /// [`open`](Self::open) to a known peer, failing unless the key that
    /// answers the handshake is the one `peer.peer_id` was derived from.
    async fn open_peer(&self, peer: &PeerRef, channel: Channel) -> Result<(TcpStream, RemotePeer), WireError> {
        let (stream, remote) = self.open(peer.addr, channel).await?;
        if remote.peer_id != peer.peer_id {
            warn!(
                addr = %peer.addr,
                expected = %peer.peer_id,
                answered = %remote.peer_id,
                "ACN: peer identity mismatch"
            );
            return Err(WireError::HandshakeFailed(format!(
                "{} answered as {}, expected {}",
                peer.addr, remote.peer_id, peer.peer_id
            )));
        }
        Ok((stream, remote))
    }

    async fn request(&self, stream: &mut TcpStream, msg: &AcnMessage) -> Result<AcnMessage, WireError> {
        write_message(stream, msg).await?;
        self.reply(stream).await
    }

    async fn reply(&self, stream: &mut TcpStream) -> Result<AcnMessage, WireError> {
        match tokio::time::timeout(self.timeouts.status(), read_message(stream, self.max_frame)).await {
            Ok(result) => result,
            Err(_) => Err(WireError::NoReply(self.timeouts.status())),
        }
    }

    async fn open_notify(
        &self,
        addr: SocketAddr,
        expected: Option<&PeerRef>,
        records: &[AgentRecord],
    ) -> Result<RemotePeer, WireError> {
        let (mut stream, mut remote) = match expected {
            Some(peer) => self.open_peer(peer, Channel::Notify).await?,
            None => self.open(addr, Channel::Notify).await?,
        };

        // The peer acknowledges once we are in its routing table.
        let ack = match tokio::time::timeout(
            self.timeouts.join_ack(),
            read_message(&mut stream, self.max_frame),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(WireError::Timeout("awaiting join acknowledgement")),
        };
        let status = ack.into_status()?;
        if !status.is_success() {
            return Err(WireError::Rejected(status));
        }

        for record in records {
            let reply = self
                .request(
                    &mut stream,
                    &AcnMessage::new(Payload::Register {
                        record: record.clone(),
                    }),
                )
                .await?;
            let status = reply.into_status()?;
            if status.is_success() {
                debug!(addr = %record.address, peer = %remote.peer_id, "ACN: address announced");
            } else {
                warn!(
                    addr = %record.address,
                    peer = %remote.peer_id,
                    code = %status.status_code,
                    "ACN: peer refused address announcement"
                );
            }
        }

        remote.listen_addr = Some(addr);
        Ok(remote)
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn join(&self, addr: SocketAddr, records: &[AgentRecord]) -> Result<RemotePeer, WireError> {
        self.open_notify(addr, None, records).await
    }

    async fn announce(&self, peer: &PeerRef, records: &[AgentRecord]) -> Result<(), WireError> {
        self.open_notify(peer.addr, Some(peer), records).await.map(|_| ())
    }

    async fn lookup(&self, peer: &PeerRef, address: &str) -> Result<LookupAnswer, WireError> {
        let (mut stream, _) = self.open_peer(peer, Channel::Address).await?;
        let reply = self
            .request(
                &mut stream,
                &AcnMessage::new(Payload::LookupRequest {
                    address: address.to_string(),
                }),
            )
            .await?;
        match reply.payload {
            Payload::LookupResponse { record, peer_addr } => Ok(LookupAnswer { record, peer_addr }),
            Payload::Status(status) => Err(WireError::Rejected(status)),
            other => Err(WireError::Protocol(AcnError::UnexpectedPayload(format!(
                "expected lookup_response, got {}",
                other.kind()
            )))),
        }
    }

    async fn forward(&self, peer: &PeerRef, message: AcnMessage) -> Result<Status, WireError> {
        let (mut stream, _) = self.open_peer(peer, Channel::Envelope).await?;
        let reply = self.request(&mut stream, &message).await?;
        Ok(reply.into_status()?)
    }
}
