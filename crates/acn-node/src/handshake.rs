//! Peer identity and the channel-opening handshake.
//!
//! Every native-transport connection names one logical channel and proves
//! both ends' Ed25519 identities before any [`AcnMessage`] flows:
//!
//! 1. initiator → `Hello { channel, public_key, nonce, auth_hmac, .. }`
//! 2. responder → `HelloAck { public_key, nonce, signature }` (signs the
//!    initiator's nonce and the channel) or `Reject { status }`
//! 3. initiator → `Proof { signature }` (signs the responder's nonce)
//!
//! With a network secret configured, `auth_hmac` must be
//! HMAC-SHA256(secret, nonce ‖ public_key).
//!
//! [`AcnMessage`]: crate::message::AcnMessage

use crate::message::PROTOCOL_VERSION;
use crate::wire::{read_frame, write_frame, WireError};
use acn_types::record::{parse_public_key, public_key_hex};
use acn_types::{AcnError, Status, StatusCode};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Handshake frames never need to be large.
const MAX_HANDSHAKE_FRAME: u32 = 16 * 1024;

/// Generate HMAC-SHA256 signature for admission.
fn hmac_sign(secret: &str, data: &[u8]) -> Result<String, WireError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WireError::HandshakeFailed(format!("bad network secret: {e}")))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    match hmac_sign(secret, data) {
        Ok(expected) => {
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
        }
        Err(_) => false,
    }
}

/// The logical stream types a peer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Join notifications and address announcements.
    #[serde(rename = "/acn/notif/0.1.0")]
    Notify,
    /// Address lookups.
    #[serde(rename = "/acn/address/0.1.0")]
    Address,
    /// Routed envelopes.
    #[serde(rename = "/acn/envelope/0.1.0")]
    Envelope,
    /// Relay client registration.
    #[serde(rename = "/acn/register/0.1.0")]
    Register,
}

impl Channel {
    pub fn protocol_id(self) -> &'static str {
        match self {
            Self::Notify => "/acn/notif/0.1.0",
            Self::Address => "/acn/address/0.1.0",
            Self::Envelope => "/acn/envelope/0.1.0",
            Self::Register => "/acn/register/0.1.0",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_id())
    }
}

/// This node's long-lived Ed25519 identity.
pub struct NodeIdentity {
    signing_key: SigningKey,
    public_key: String,
    peer_id: String,
}

impl NodeIdentity {
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let public_key = public_key_hex(&verifying_key);
        let peer_id = peer_id_for(&public_key);
        Self {
            signing_key,
            public_key,
            peer_id,
        }
    }

    /// Hex-encoded public key, as placed in agent records.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    fn sign_challenge(&self, nonce: &str, channel: Channel) -> String {
        hex::encode(self.signing_key.sign(&challenge(nonce, channel)).to_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Peer id of a hex public key: hex SHA-256 of the key bytes.
pub fn peer_id_for(public_key: &str) -> String {
    let bytes = hex::decode(public_key).unwrap_or_else(|_| public_key.as_bytes().to_vec());
    hex::encode(Sha256::digest(&bytes))
}

fn challenge(nonce: &str, channel: Channel) -> Vec<u8> {
    let mut data = Vec::with_capacity(nonce.len() + 32);
    data.extend_from_slice(nonce.as_bytes());
    data.extend_from_slice(channel.protocol_id().as_bytes());
    data
}

fn verify_challenge(
    public_key: &str,
    nonce: &str,
    channel: Channel,
    signature: &str,
) -> Result<(), WireError> {
    let key = parse_public_key(public_key)
        .map_err(|e| WireError::HandshakeFailed(format!("bad peer key: {e}")))?;
    let sig_bytes: [u8; 64] = hex::decode(signature)
        .map_err(|e| WireError::HandshakeFailed(format!("signature is not hex: {e}")))?
        .as_slice()
        .try_into()
        .map_err(|_| WireError::HandshakeFailed("invalid signature length".into()))?;
    key.verify(&challenge(nonce, channel), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| WireError::HandshakeFailed("challenge signature mismatch".into()))
}

/// Handshake frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Hello {
        version: String,
        channel: Channel,
        public_key: String,
        /// Where the initiator accepts connections, if it is a full peer.
        #[serde(default)]
        listen_addr: Option<SocketAddr>,
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    HelloAck {
        public_key: String,
        nonce: String,
        signature: String,
    },
    Reject {
        status: Status,
    },
    Proof {
        signature: String,
    },
}

/// The authenticated far end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub public_key: String,
    pub peer_id: String,
    pub listen_addr: Option<SocketAddr>,
}

/// Knobs shared by both handshake roles.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    pub network_secret: Option<String>,
    /// Advertised in `Hello`; `None` for clients that accept no connections.
    pub listen_addr: Option<SocketAddr>,
}

fn new_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run the initiator side of the handshake on `stream`.
pub async fn initiate<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    channel: Channel,
    options: &HandshakeOptions,
) -> Result<RemotePeer, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = new_nonce();
    let auth_hmac = match &options.network_secret {
        Some(secret) => hmac_sign(secret, format!("{}{}", nonce, identity.public_key()).as_bytes())?,
        None => String::new(),
    };
    let hello = HandshakeMessage::Hello {
        version: PROTOCOL_VERSION.to_string(),
        channel,
        public_key: identity.public_key().to_string(),
        listen_addr: options.listen_addr,
        nonce: nonce.clone(),
        auth_hmac,
    };
    write_frame(stream, &hello).await?;

    let reply: HandshakeMessage = read_frame(stream, MAX_HANDSHAKE_FRAME).await?;
    let (public_key, ack_nonce) = match reply {
        HandshakeMessage::HelloAck {
            public_key,
            nonce: ack_nonce,
            signature,
        } => {
            verify_challenge(&public_key, &nonce, channel, &signature)?;
            (public_key, ack_nonce)
        }
        HandshakeMessage::Reject { status } => {
            return Err(match AcnError::from_status(&status) {
                Some(e @ AcnError::UnsupportedVersion { .. }) => WireError::Protocol(e),
                _ => WireError::Rejected(status),
            });
        }
        _ => {
            return Err(WireError::HandshakeFailed(
                "Unexpected response to hello".into(),
            ))
        }
    };

    let proof = HandshakeMessage::Proof {
        signature: identity.sign_challenge(&ack_nonce, channel),
    };
    write_frame(stream, &proof).await?;

    Ok(RemotePeer {
        peer_id: peer_id_for(&public_key),
        public_key,
        listen_addr: None,
    })
}

/// Run the responder side of the handshake on `stream`.
///
/// Returns the channel the initiator asked for and its proven identity.
pub async fn accept<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    options: &HandshakeOptions,
) -> Result<(Channel, RemotePeer), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: HandshakeMessage = read_frame(stream, MAX_HANDSHAKE_FRAME).await?;
    let HandshakeMessage::Hello {
        version,
        channel,
        public_key,
        listen_addr,
        nonce,
        auth_hmac,
    } = hello
    else {
        let status = Status::error(StatusCode::ErrorGeneric, "handshake required");
        write_frame(stream, &HandshakeMessage::Reject { status }).await?;
        return Err(WireError::HandshakeFailed(
            "Rejected unauthenticated request, hello required".into(),
        ));
    };

    if version != PROTOCOL_VERSION {
        let err = AcnError::UnsupportedVersion {
            expected: PROTOCOL_VERSION.to_string(),
            found: version,
        };
        write_frame(
            stream,
            &HandshakeMessage::Reject {
                status: err.to_status(),
            },
        )
        .await?;
        return Err(WireError::Protocol(err));
    }

    if let Some(secret) = &options.network_secret {
        let data = format!("{}{}", nonce, public_key);
        if !hmac_verify(secret, data.as_bytes(), &auth_hmac) {
            warn!(peer_key = %public_key, "ACN: rejected peer without network admission");
            let status = Status::error(StatusCode::ErrorGeneric, "network admission failed");
            write_frame(stream, &HandshakeMessage::Reject { status }).await?;
            return Err(WireError::HandshakeFailed(
                "HMAC verification failed on incoming hello".into(),
            ));
        }
    }

    let ack_nonce = new_nonce();
    let ack = HandshakeMessage::HelloAck {
        public_key: identity.public_key().to_string(),
        nonce: ack_nonce.clone(),
        signature: identity.sign_challenge(&nonce, channel),
    };
    write_frame(stream, &ack).await?;

    let proof: HandshakeMessage = read_frame(stream, MAX_HANDSHAKE_FRAME).await?;
    match proof {
        HandshakeMessage::Proof { signature } => {
            verify_challenge(&public_key, &ack_nonce, channel, &signature)?;
        }
        _ => {
            return Err(WireError::HandshakeFailed(
                "Expected proof after hello ack".into(),
            ))
        }
    }

    Ok((
        channel,
        RemotePeer {
            peer_id: peer_id_for(&public_key),
            public_key,
            listen_addr,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::record::generate_signing_key;

    fn identity() -> NodeIdentity {
        NodeIdentity::new(generate_signing_key())
    }

    #[tokio::test]
    async fn test_handshake_proves_both_keys() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let a = identity();
        let b = identity();
        let b_key = b.public_key().to_string();
        let a_key = a.public_key().to_string();

        let listen: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let server_task = tokio::spawn(async move {
            accept(&mut server, &b, &HandshakeOptions::default()).await
        });
        let options = HandshakeOptions {
            network_secret: None,
            listen_addr: Some(listen),
        };
        let remote = initiate(&mut client, &a, Channel::Address, &options)
            .await
            .unwrap();
        assert_eq!(remote.public_key, b_key);

        let (channel, initiator) = server_task.await.unwrap().unwrap();
        assert_eq!(channel, Channel::Address);
        assert_eq!(initiator.public_key, a_key);
        assert_eq!(initiator.listen_addr, Some(listen));
        assert_eq!(initiator.peer_id, peer_id_for(&a_key));
    }

    #[tokio::test]
    async fn test_secret_mismatch_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let a = identity();
        let b = identity();
        let server_task = tokio::spawn(async move {
            let options = HandshakeOptions {
                network_secret: Some("right".into()),
                listen_addr: None,
            };
            accept(&mut server, &b, &options).await
        });
        let options = HandshakeOptions {
            network_secret: Some("wrong".into()),
            listen_addr: None,
        };
        let err = initiate(&mut client, &a, Channel::Notify, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Rejected(_)), "got {err:?}");
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let b = identity();
        let server_task =
            tokio::spawn(async move { accept(&mut server, &b, &HandshakeOptions::default()).await });

        let hello = HandshakeMessage::Hello {
            version: "9.0.0".into(),
            channel: Channel::Envelope,
            public_key: identity().public_key().to_string(),
            listen_addr: None,
            nonce: "n".into(),
            auth_hmac: String::new(),
        };
        write_frame(&mut client, &hello).await.unwrap();
        let reply: HandshakeMessage = read_frame(&mut client, MAX_HANDSHAKE_FRAME).await.unwrap();
        match reply {
            HandshakeMessage::Reject { status } => {
                assert_eq!(status.status_code, StatusCode::ErrorUnsupportedVersion)
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(matches!(
            server_task.await.unwrap(),
            Err(WireError::Protocol(AcnError::UnsupportedVersion { .. }))
        ));
    }

    #[test]
    fn test_channel_ids() {
        let json = serde_json::to_string(&Channel::Register).unwrap();
        assert_eq!(json, "\"/acn/register/0.1.0\"");
        assert_eq!(Channel::Notify.to_string(), "/acn/notif/0.1.0");
    }
}
