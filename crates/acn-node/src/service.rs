//! Inbound channel handlers of a [`PeerNode`].
//!
//! Each accepted native-transport connection is authenticated by the
//! handshake and then served according to the channel it named:
//!
//! | channel | requests | reply |
//! |---|---|---|
//! | notify | join, then `Register` announcements | `Status` |
//! | address | `LookupRequest` | `LookupResponse` or `Status` |
//! | envelope | `AeaEnvelope` | `Status` |
//! | register | one `Register`, then a relay client session | `Status` |
//!
//! Delegate connections skip the handshake and start at the register step.

use crate::bootstrap::announce_records;
use crate::clients::{ClientKind, ClientLink, ClientRegistry, ClientSession, LinkCommand, RegisterOutcome};
use crate::handshake::{self, Channel, HandshakeOptions, RemotePeer};
use crate::message::{AcnMessage, Payload};
use crate::peer::PeerNode;
use crate::registry::{PeerEntry, PeerRef, PeerState};
use crate::wire::{read_message, write_message, WireError};
use acn_types::{record, AcnError, AcnResult, AgentRecord, Status, StatusCode};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl PeerNode {
    pub(crate) async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let options = HandshakeOptions {
            network_secret: self.config.network_secret.clone(),
            listen_addr: Some(self.public_addr()),
        };
        let accepted = tokio::time::timeout(
            self.config.timeouts.new_stream(),
            handshake::accept(&mut stream, &self.identity, &options),
        )
        .await;
        let (channel, remote) = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                warn!(remote = %addr, error = %e, "ACN: handshake failed");
                return;
            }
            Err(_) => {
                warn!(remote = %addr, "ACN: handshake timed out");
                return;
            }
        };
        debug!(remote = %addr, peer = %remote.peer_id, channel = %channel, "ACN: channel opened");

        if channel != Channel::Notify && !self.is_ready() {
            let status = Status::error(StatusCode::ErrorGeneric, "peer is bootstrapping");
            let _ = write_message(&mut stream, &AcnMessage::status(status)).await;
            return;
        }

        let result = match channel {
            Channel::Notify => self.serve_notify(&mut stream, &remote).await,
            Channel::Address => self.serve_address(&mut stream, &remote).await,
            Channel::Envelope => self.serve_envelope(&mut stream, &remote).await,
            Channel::Register => {
                if self.config.relay.enabled {
                    self.accept_client(ClientKind::Relay, stream).await;
                    Ok(())
                } else {
                    let status = Status::error(StatusCode::ErrorGeneric, "relay service is disabled");
                    write_message(&mut stream, &AcnMessage::status(status)).await
                }
            }
        };
        if let Err(e) = result {
            debug!(remote = %addr, channel = %channel, error = %e, "ACN: channel ended");
        }
    }

    /// Read the next request, answering undecodable frames in place.
    ///
    /// `Ok(None)` means the other side closed the stream.
    async fn next_request<S>(&self, stream: &mut S) -> Result<Option<AcnMessage>, WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match read_message(stream, self.config.max_frame_size).await {
                Ok(msg) => return Ok(Some(msg)),
                Err(WireError::Protocol(e)) => {
                    warn!(code = %e.status_code(), error = %e, "ACN: undecodable request");
                    write_message(stream, &AcnMessage::status(e.to_status())).await?;
                }
                Err(WireError::ConnectionClosed) => return Ok(None),
                Err(e @ WireError::MessageTooLarge { .. }) => {
                    // The oversized body is still on the stream, so the exchange ends here.
                    warn!(error = %e, "ACN: oversized request");
                    let _ = write_message(stream, &AcnMessage::status(e.to_status())).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn serve_notify<S>(self: &Arc<Self>, stream: &mut S, remote: &RemotePeer) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(listen_addr) = remote.listen_addr else {
            let status = Status::error(StatusCode::ErrorGeneric, "join requires a listen address");
            return write_message(stream, &AcnMessage::status(status)).await;
        };
        let peer = PeerRef {
            peer_id: remote.peer_id.clone(),
            addr: listen_addr,
        };

        let is_new = self.peers.add_peer(PeerEntry {
            peer_id: remote.peer_id.clone(),
            public_key: remote.public_key.clone(),
            address: listen_addr,
            state: PeerState::Connected,
            connected_at: Utc::now(),
        });
        // The joining peer waits for this before announcing.
        write_message(stream, &AcnMessage::success()).await?;

        if is_new {
            info!(peer = %peer.peer_id, addr = %listen_addr, "ACN: peer joined");
            self.announced.forget_peer(&peer.peer_id);
            let node = Arc::clone(self);
            tokio::spawn(async move {
                let records = node.directory.local_records();
                if !records.is_empty() {
                    announce_records(node.transport.as_ref(), &node.peers, &node.announced, &records).await;
                }
            });
        }

        while let Some(msg) = self.next_request(stream).await? {
            let status = match msg.payload {
                Payload::Register { record } => {
                    match record::verify(&record, Some(&record.address), Some(&remote.public_key)) {
                        Ok(()) => {
                            debug!(op = "announce", addr = %record.address, peer = %peer.peer_id, "ACN: address announced to us");
                            self.directory.put(record, peer.clone());
                            Status::success()
                        }
                        Err(e) => {
                            warn!(op = "announce", addr = %record.address, peer = %peer.peer_id, error = %e, "ACN: rejected announcement");
                            e.to_status()
                        }
                    }
                }
                other => unexpected(&other, Channel::Notify),
            };
            write_message(stream, &AcnMessage::status(status)).await?;
        }
        Ok(())
    }

    async fn serve_address<S>(&self, stream: &mut S, remote: &RemotePeer) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = self.next_request(stream).await? {
            let reply = match msg.payload {
                Payload::LookupRequest { address } => {
                    self.stats.record_lookup_served();
                    match self.directory.answer_lookup(&address) {
                        Some((record, peer_addr)) => {
                            debug!(op = "lookup", addr = %address, requester = %remote.peer_id, "ACN: lookup answered");
                            AcnMessage::new(Payload::LookupResponse {
                                record,
                                peer_addr: Some(peer_addr),
                            })
                        }
                        None => {
                            debug!(op = "lookup", addr = %address, requester = %remote.peer_id, "ACN: lookup miss");
                            AcnMessage::status(AcnError::UnknownAgentAddress(address).to_status())
                        }
                    }
                }
                other => AcnMessage::status(unexpected(&other, Channel::Address)),
            };
            write_message(stream, &reply).await?;
        }
        Ok(())
    }

    async fn serve_envelope<S>(&self, stream: &mut S, remote: &RemotePeer) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = self.next_request(stream).await? {
            let status = match msg.payload {
                Payload::AeaEnvelope { envelope, record } => {
                    self.router
                        .route_from_peer(&envelope, record, &remote.public_key)
                        .await
                }
                other => unexpected(&other, Channel::Envelope),
            };
            write_message(stream, &AcnMessage::status(status)).await?;
        }
        Ok(())
    }

    /// Take a client's `Register`, then serve its session.
    pub(crate) async fn accept_client<S>(self: Arc<Self>, kind: ClientKind, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let first = tokio::time::timeout(
            self.config.timeouts.new_stream(),
            read_message(&mut stream, self.config.max_frame_size),
        )
        .await;
        let record = match first {
            Ok(Ok(AcnMessage {
                payload: Payload::Register { record },
                ..
            })) => record,
            Ok(Ok(other)) => {
                let status = unexpected(&other.payload, Channel::Register);
                let _ = write_message(&mut stream, &AcnMessage::status(status)).await;
                return;
            }
            Ok(Err(e)) => {
                debug!(kind = %kind, error = %e, "ACN: client left before registering");
                let _ = write_message(&mut stream, &AcnMessage::status(e.to_status())).await;
                return;
            }
            Err(_) => {
                debug!(kind = %kind, "ACN: client did not register in time");
                return;
            }
        };

        let delay = self.config.registration_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let address = record.address.clone();
        let (link, commands) = match self.register_client(kind, record).await {
            Ok(registered) => registered,
            Err(e) => {
                let _ = write_message(&mut stream, &AcnMessage::status(e.to_status())).await;
                return;
            }
        };
        if write_message(&mut stream, &AcnMessage::success()).await.is_err() {
            self.registry(kind).mark_disconnected(&address, link.id());
            return;
        }

        ClientSession {
            address,
            link,
            commands,
            registry: self.registry(kind).clone(),
            router: Arc::clone(&self.router),
            max_frame: self.config.max_frame_size,
            shutdown: self.shutdown_signal(),
        }
        .run(stream)
        .await;
    }

    fn registry(&self, kind: ClientKind) -> &ClientRegistry {
        match kind {
            ClientKind::Relay => self.directory.relay(),
            ClientKind::Delegate => self.directory.delegate(),
        }
    }

    /// Verify, insert, persist, announce. Nothing is inserted unless the
    /// record verifies.
    async fn register_client(
        &self,
        kind: ClientKind,
        record: AgentRecord,
    ) -> AcnResult<(ClientLink, mpsc::Receiver<LinkCommand>)> {
        if let Err(e) = record::verify(&record, Some(&record.address), Some(self.identity.public_key())) {
            warn!(op = "register", kind = %kind, addr = %record.address, code = %e.status_code(), error = %e, "ACN: registration rejected");
            return Err(e);
        }

        let registry = self.registry(kind);
        let (link, commands) = registry.open_link();
        let outcome = registry
            .register(record.clone(), Some(link.clone()))
            .map_err(|e| {
                warn!(op = "register", kind = %kind, addr = %record.address, error = %e, "ACN: registration refused");
                e
            })?;

        if kind == ClientKind::Relay {
            if let Some(store) = &self.store {
                if let Err(e) = store.append(&record) {
                    warn!(addr = %record.address, error = %e, "ACN: failed to persist relay record");
                }
            }
        }
        self.stats.record_registration();
        info!(
            op = "register",
            kind = %kind,
            addr = %record.address,
            replaced = outcome == RegisterOutcome::Replaced,
            "ACN: client registered"
        );

        let announced = announce_records(
            self.transport.as_ref(),
            &self.peers,
            &self.announced,
            std::slice::from_ref(&record),
        )
        .await;
        debug!(addr = %record.address, peers = announced, "ACN: client address announced");

        Ok((link, commands))
    }
}

fn unexpected(payload: &Payload, channel: Channel) -> Status {
    let err = AcnError::UnexpectedPayload(format!(
        "{} is not accepted on {}",
        payload.kind(),
        channel.protocol_id()
    ));
    warn!(channel = %channel, error = %err, "ACN: unexpected payload");
    err.to_status()
}
