//! Routed envelopes and the local-agent bridge line format.
//!
//! The ACN never interprets `message`; it only reads `to` and `sender` to
//! route. Between peers an envelope travels JSON-encoded inside an
//! `AeaEnvelope` payload. Between a peer and its directly attached agent it
//! travels as one line: `TO,SENDER,PROTOCOL_ID,BASE64_MESSAGE`.

use crate::error::{AcnError, AcnResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// An opaque agent-to-agent message plus its routing header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination agent address.
    pub to: String,
    /// Originating agent address.
    pub sender: String,
    pub protocol_id: String,
    #[serde(with = "crate::base64_bytes")]
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl Envelope {
    pub fn new(
        to: impl Into<String>,
        sender: impl Into<String>,
        protocol_id: impl Into<String>,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            protocol_id: protocol_id.into(),
            message: message.into(),
            uri: None,
        }
    }

    /// Encode for an `AeaEnvelope` payload.
    pub fn encode(&self) -> AcnResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AcnError::Serialization(e.to_string()))
    }

    /// Decode the bytes of an `AeaEnvelope` payload.
    pub fn decode(bytes: &[u8]) -> AcnResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| AcnError::Serialization(format!("malformed envelope: {e}")))
    }

    /// Render as a bridge line, without the trailing newline.
    pub fn to_line(&self) -> AcnResult<String> {
        for (name, field) in [
            ("to", &self.to),
            ("sender", &self.sender),
            ("protocol_id", &self.protocol_id),
        ] {
            if field.contains([',', '\n']) {
                return Err(AcnError::Serialization(format!(
                    "envelope {name} must not contain ',' or newline"
                )));
            }
        }
        Ok(format!(
            "{},{},{},{}",
            self.to,
            self.sender,
            self.protocol_id,
            STANDARD.encode(&self.message)
        ))
    }

    /// Parse a bridge line (a trailing `\r\n` or `\n` is ignored).
    pub fn from_line(line: &str) -> AcnResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(4, ',');
        let (Some(to), Some(sender), Some(protocol_id), Some(encoded)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AcnError::Serialization(
                "bridge line must be TO,SENDER,PROTOCOL_ID,MESSAGE".into(),
            ));
        };
        if to.is_empty() || sender.is_empty() {
            return Err(AcnError::Serialization(
                "bridge line has an empty address".into(),
            ));
        }
        let message = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| AcnError::Serialization(format!("bridge message is not base64: {e}")))?;
        Ok(Self::new(to, sender, protocol_id, message))
    }
}
