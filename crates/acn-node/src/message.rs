//! ACN protocol messages.
//!
//! Every message carries the protocol version and exactly one payload.
//! On the wire the payload fields are flattened next to `version` and
//! discriminated by `type`:
//!
//! ```json
//! {"version":"0.1.0","type":"lookup_request","address":"3f2a..."}
//! ```

use acn_types::{AcnError, AgentRecord, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Current protocol version.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Payload type tags understood by this node.
const PAYLOAD_TYPES: &[&str] = &[
    "status",
    "register",
    "lookup_request",
    "lookup_response",
    "aea_envelope",
];

/// A versioned ACN message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcnMessage {
    pub version: String,
    #[serde(flatten)]
    pub payload: Payload,
}

/// The single payload of an [`AcnMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Reply to any request.
    Status(Status),
    /// Ask a peer to represent an address.
    Register { record: AgentRecord },
    /// Ask a peer which peer represents an address.
    LookupRequest { address: String },
    /// Answer to a lookup.
    LookupResponse {
        record: AgentRecord,
        /// Listen address of the representing peer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_addr: Option<SocketAddr>,
    },
    /// A routed envelope with the sender's proof of representation.
    AeaEnvelope {
        #[serde(with = "acn_types::base64_bytes")]
        envelope: Vec<u8>,
        record: AgentRecord,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Register { .. } => "register",
            Self::LookupRequest { .. } => "lookup_request",
            Self::LookupResponse { .. } => "lookup_response",
            Self::AeaEnvelope { .. } => "aea_envelope",
        }
    }
}

impl AcnMessage {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }

    pub fn status(status: Status) -> Self {
        Self::new(Payload::Status(status))
    }

    pub fn success() -> Self {
        Self::status(Status::success())
    }

    /// Unwrap a `Status` payload, or fail with `ERROR_UNEXPECTED_PAYLOAD`.
    pub fn into_status(self) -> Result<Status, AcnError> {
        match self.payload {
            Payload::Status(status) => Ok(status),
            other => Err(AcnError::UnexpectedPayload(format!(
                "expected status, got {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Display for AcnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.payload.kind(), self.version)
    }
}

/// Decode a frame body.
///
/// Failures are classified in the order the peer must report them:
/// unparseable JSON or a missing version is `ERROR_SERIALIZATION`, a foreign
/// version is `ERROR_UNSUPPORTED_VERSION`, an unknown payload type is
/// `ERROR_UNEXPECTED_PAYLOAD`, and a known type with bad fields is
/// `ERROR_SERIALIZATION` again.
pub fn decode_message(body: &[u8]) -> Result<AcnMessage, AcnError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AcnError::Serialization(format!("malformed message: {e}")))?;

    let version = value
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AcnError::Serialization("message has no version".into()))?;
    if version != PROTOCOL_VERSION {
        return Err(AcnError::UnsupportedVersion {
            expected: PROTOCOL_VERSION.to_string(),
            found: version.to_string(),
        });
    }

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AcnError::Serialization("message has no payload".into()))?;
    if !PAYLOAD_TYPES.contains(&kind) {
        return Err(AcnError::UnexpectedPayload(format!(
            "unknown payload type {kind}"
        )));
    }

    AcnMessage::deserialize(&value)
        .map_err(|e| AcnError::Serialization(format!("malformed {kind} payload: {e}")))
}
