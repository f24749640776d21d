//! Client side of the relay and delegate services.
//!
//! An [`AgentClient`] is what an agent without its own peer uses to reach
//! the network: it registers its record with a peer, sends envelopes, and
//! receives the envelopes the peer delivers to it. Every delivered envelope
//! is acknowledged with a `Status` so the delivering peer can report
//! success to the sender.

use crate::handshake::{self, Channel, HandshakeOptions, NodeIdentity};
use crate::message::{AcnMessage, Payload};
use crate::retry::{is_retryable, retry_async, RetryConfig, RetryOutcome};
use crate::wire::{read_message, write_message, WireError};
use acn_types::config::DEFAULT_MAX_FRAME_SIZE;
use acn_types::{AcnError, AgentRecord, Envelope, Status, StatusCode};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLIENT_BUFFER: usize = 64;

/// Default wait for a status reply.
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(30);

struct Outgoing {
    message: AcnMessage,
    reply: oneshot::Sender<Status>,
}

pub struct AgentClient {
    record: AgentRecord,
    outgoing: mpsc::Sender<Outgoing>,
    inbox: mpsc::Receiver<Envelope>,
    status_timeout: Duration,
    task: JoinHandle<()>,
}

impl AgentClient {
    /// Register with the delegate service listening at `addr`.
    pub async fn connect_delegate(addr: SocketAddr, record: AgentRecord) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        Self::register(stream, record).await
    }

    /// Register as a relay client of the peer listening at `addr`.
    ///
    /// `identity` authenticates the connection; `record` must be
    /// countersigned by the relay peer.
    pub async fn connect_relay(
        addr: SocketAddr,
        identity: &NodeIdentity,
        record: AgentRecord,
        options: &HandshakeOptions,
    ) -> Result<Self, WireError> {
        let mut stream = TcpStream::connect(addr).await?;
        handshake::initiate(&mut stream, identity, Channel::Register, options).await?;
        Self::register(stream, record).await
    }

    /// Send `Register` on an open stream and wait for the peer to accept.
    pub async fn register<S>(mut stream: S, record: AgentRecord) -> Result<Self, WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        write_message(
            &mut stream,
            &AcnMessage::new(Payload::Register {
                record: record.clone(),
            }),
        )
        .await?;
        let reply = match tokio::time::timeout(
            DEFAULT_STATUS_TIMEOUT,
            read_message(&mut stream, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        {
            Ok(reply) => reply?,
            Err(_) => return Err(WireError::Timeout("awaiting registration status")),
        };
        let status = reply.into_status()?;
        if !status.is_success() {
            return Err(WireError::Rejected(status));
        }
        info!(addr = %record.address, "ACN: client registered");

        let (outgoing, commands) = mpsc::channel(CLIENT_BUFFER);
        let (deliveries, inbox) = mpsc::channel(CLIENT_BUFFER);
        let task = tokio::spawn(run_client(stream, commands, deliveries));
        Ok(Self {
            record,
            outgoing,
            inbox,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            task,
        })
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    pub fn set_status_timeout(&mut self, timeout: Duration) {
        self.status_timeout = timeout;
    }

    /// Send one envelope and return the peer's status for it.
    pub async fn send(&self, envelope: &Envelope) -> Result<Status, WireError> {
        let message = AcnMessage::new(Payload::AeaEnvelope {
            envelope: envelope.encode()?,
            record: self.record.clone(),
        });
        let (reply, status) = oneshot::channel();
        self.outgoing
            .send(Outgoing { message, reply })
            .await
            .map_err(|_| WireError::ConnectionClosed)?;
        match tokio::time::timeout(self.status_timeout, status).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => Err(WireError::Timeout("awaiting envelope status")),
        }
    }

    /// [`send`](Self::send) under a retry policy.
    ///
    /// Error statuses that may clear up (`ERROR_AGENT_NOT_READY`,
    /// `ERROR_UNKNOWN_AGENT_ADDRESS`, `ERROR_GENERIC`) and timeouts are
    /// retried; the last status is returned once attempts run out.
    pub async fn send_with_retry(&self, envelope: &Envelope, retry: &RetryConfig) -> Result<Status, WireError> {
        let outcome = retry_async(
            retry,
            || async {
                let status = self.send(envelope).await?;
                if status.is_success() {
                    Ok(status)
                } else {
                    Err(WireError::Rejected(status))
                }
            },
            |e: &WireError| match e {
                WireError::Rejected(status) => is_retryable(status),
                WireError::Timeout(_) | WireError::NoReply(_) => true,
                _ => false,
            },
        )
        .await;
        match outcome {
            RetryOutcome::Success { result, .. } => Ok(result),
            RetryOutcome::Exhausted {
                last_error: WireError::Rejected(status),
                ..
            } => Ok(status),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    /// Next envelope delivered by the peer; `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Envelope> {
        tokio::time::timeout(wait, self.inbox.recv()).await.ok().flatten()
    }

    /// Close the connection.
    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_client<S>(stream: S, mut commands: mpsc::Receiver<Outgoing>, deliveries: mpsc::Sender<Envelope>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (frame_tx, mut frames) = mpsc::channel::<Result<AcnMessage, AcnError>>(CLIENT_BUFFER);
    let reader_task = ReaderGuard(tokio::spawn(async move {
        loop {
            let frame = match read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE).await {
                Ok(msg) => Ok(msg),
                Err(WireError::Protocol(e)) => Err(e),
                Err(e) => {
                    debug!(error = %e, "ACN: client link closed");
                    break;
                }
            };
            if frame_tx.send(frame).await.is_err() {
                break;
            }
        }
    }));

    let mut pending: VecDeque<oneshot::Sender<Status>> = VecDeque::new();
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(Outgoing { message, reply }) = command else { break };
                if write_message(&mut writer, &message).await.is_err() {
                    break;
                }
                pending.push_back(reply);
            }
            frame = frames.recv() => {
                let msg = match frame {
                    None => break,
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(error = %e, "ACN: undecodable frame from peer");
                        continue;
                    }
                };
                match msg.payload {
                    Payload::Status(status) => match pending.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(status);
                        }
                        None => debug!(code = %status.status_code, "ACN: unsolicited status from peer"),
                    },
                    Payload::AeaEnvelope { envelope, .. } => {
                        let ack = match Envelope::decode(&envelope) {
                            Ok(envelope) => {
                                if deliveries.send(envelope).await.is_err() {
                                    Status::error(StatusCode::ErrorAgentNotReady, "client is closing")
                                } else {
                                    Status::success()
                                }
                            }
                            Err(e) => e.to_status(),
                        };
                        if write_message(&mut writer, &AcnMessage::status(ack)).await.is_err() {
                            break;
                        }
                    }
                    other => debug!(kind = other.kind(), "ACN: ignoring payload on client link"),
                }
            }
        }
    }
    drop(reader_task);
}

/// Stops the reader with the client task, including when that task is aborted.
struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
