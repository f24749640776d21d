//! Bridge to the one agent process attached directly to this peer.
//!
//! The agent connects to the bridge listener and exchanges one envelope per
//! line in the form `TO,SENDER,PROTOCOL_ID,BASE64_MESSAGE`. Lines from the
//! agent are routed in arrival order; envelopes for the agent are written
//! back on the same stream.
//!
//! Readiness is a `watch` signal raised while an agent is attached, so the
//! router waits on a notification with a timeout rather than polling.

use crate::router::EnvelopeRouter;
use acn_types::{AcnError, AcnResult, Envelope};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BRIDGE_BUFFER: usize = 64;

struct BridgeCommand {
    line: String,
    written: oneshot::Sender<io::Result<()>>,
}

struct BridgeLink {
    id: u64,
    tx: mpsc::Sender<BridgeCommand>,
}

pub struct LocalAgentBridge {
    address: Option<String>,
    ready: watch::Sender<bool>,
    link: Mutex<Option<BridgeLink>>,
    next_id: AtomicU64,
}

impl LocalAgentBridge {
    /// `address` is the local agent's address, if this peer has one.
    pub fn new(address: Option<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            address,
            ready,
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Attach the agent connection and serve it until it closes.
    ///
    /// Fails when an agent is already attached.
    pub fn attach<S>(self: &Arc<Self>, stream: S, router: Arc<EnvelopeRouter>) -> AcnResult<JoinHandle<()>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.address.is_none() {
            return Err(AcnError::Generic("this peer has no local agent".into()));
        }

        let (tx, mut commands) = mpsc::channel::<BridgeCommand>(BRIDGE_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            if link.is_some() {
                return Err(AcnError::Generic("local agent already attached".into()));
            }
            *link = Some(BridgeLink { id, tx });
        }
        self.ready.send_replace(true);
        info!(addr = ?self.address, "ACN: local agent attached");

        let bridge = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(stream);
            let mut lines = BufReader::new(reader).lines();

            let (route_tx, mut route_rx) = mpsc::channel::<Envelope>(BRIDGE_BUFFER);
            let route_task = tokio::spawn(async move {
                while let Some(envelope) = route_rx.recv().await {
                    let to = envelope.to.clone();
                    if let Some(status) = router.route_from_local_agent(envelope).await {
                        if !status.is_success() {
                            warn!(
                                op = "route",
                                to = %to,
                                code = %status.status_code,
                                errors = ?status.error_messages,
                                "ACN: envelope from local agent not delivered"
                            );
                        }
                    }
                }
            });

            loop {
                tokio::select! {
                    command = commands.recv() => {
                        let Some(command) = command else { break };
                        let result = write_line(&mut writer, &command.line).await;
                        let failed = result.is_err();
                        let _ = command.written.send(result);
                        if failed {
                            break;
                        }
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match Envelope::from_line(&line) {
                            Ok(envelope) => {
                                if route_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "ACN: undecodable line from local agent"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "ACN: local agent stream read failed");
                            break;
                        }
                    },
                }
            }

            drop(route_tx);
            let _ = route_task.await;
            bridge.detach(id);
        });
        Ok(handle)
    }

    fn detach(&self, id: u64) {
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        if link.as_ref().map(|l| l.id) == Some(id) {
            *link = None;
            self.ready.send_replace(false);
            info!(addr = ?self.address, "ACN: local agent detached");
        }
    }

    /// Drop the current link; its session ends once pending writes finish.
    pub fn close(&self) {
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        *link = None;
        self.ready.send_replace(false);
    }

    /// Write `envelope` to the agent, waiting up to `wait` for it to attach.
    pub async fn deliver(&self, envelope: &Envelope, wait: Duration) -> AcnResult<()> {
        let mut ready = self.ready.subscribe();
        let became_ready = tokio::time::timeout(wait, ready.wait_for(|r| *r))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !became_ready {
            return Err(AcnError::AgentNotReady(format!(
                "local agent not attached within {wait:?}"
            )));
        }

        let line = envelope.to_line()?;
        let tx = {
            let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            link.as_ref().map(|l| l.tx.clone())
        };
        let tx = tx.ok_or_else(|| AcnError::AgentNotReady("local agent detached".into()))?;

        let (written, done) = oneshot::channel();
        tx.send(BridgeCommand { line, written })
            .await
            .map_err(|_| AcnError::AgentNotReady("local agent detached".into()))?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AcnError::AgentNotReady(format!("write to local agent failed: {e}"))),
            Err(_) => Err(AcnError::AgentNotReady("local agent detached".into())),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::StatusCode;

    #[tokio::test]
    async fn test_deliver_without_agent_is_not_ready() {
        let bridge = LocalAgentBridge::new(Some("me".into()));
        let envelope = Envelope::new("me", "you", "proto/1.0.0", b"hi".to_vec());
        let err = bridge
            .deliver(&envelope, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorAgentNotReady);
        assert!(!bridge.is_ready());
    }
}
