//! Shared error type for the ACN.

use crate::status::{Status, StatusCode};
use thiserror::Error;

/// Errors surfaced by ACN operations.
///
/// Every variant maps onto exactly one wire [`StatusCode`], so a failure can
/// always be answered with a [`Status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcnError {
    /// The message was encoded with a protocol version we do not speak.
    #[error("Unsupported protocol version: expected {expected}, got {found}")]
    UnsupportedVersion {
        /// The version this node speaks.
        expected: String,
        /// The version found on the wire.
        found: String,
    },

    /// The payload is valid but not allowed in this exchange.
    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// A failure with no more specific classification.
    #[error("{0}")]
    Generic(String),

    /// The message or envelope could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The record names a different agent than expected.
    #[error("Wrong agent address: expected {expected}, got {found}")]
    WrongAgentAddress {
        /// The address the context required.
        expected: String,
        /// The address carried by the record.
        found: String,
    },

    /// The record is countersigned by a different peer than the one asserting it.
    #[error("Wrong peer public key: expected {expected}, got {found}")]
    WrongPublicKey {
        /// The key of the asserting peer.
        expected: String,
        /// The key carried by the record.
        found: String,
    },

    /// Signature, key material or validity window is invalid.
    #[error("Invalid proof of representation: {0}")]
    InvalidProof(String),

    /// The record names a ledger this node cannot verify.
    #[error("Unsupported ledger: {0}")]
    UnsupportedLedger(String),

    /// No peer could resolve the address.
    #[error("Unknown agent address: {0}")]
    UnknownAgentAddress(String),

    /// The agent is known but cannot accept envelopes right now.
    #[error("Agent not ready: {0}")]
    AgentNotReady(String),

    /// Invalid node configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AcnError {
    /// The wire status code that reports this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedVersion { .. } => StatusCode::ErrorUnsupportedVersion,
            Self::UnexpectedPayload(_) => StatusCode::ErrorUnexpectedPayload,
            Self::Generic(_) | Self::Config(_) => StatusCode::ErrorGeneric,
            Self::Serialization(_) => StatusCode::ErrorSerialization,
            Self::WrongAgentAddress { .. } => StatusCode::ErrorWrongAgentAddress,
            Self::WrongPublicKey { .. } => StatusCode::ErrorWrongPublicKey,
            Self::InvalidProof(_) => StatusCode::ErrorInvalidProof,
            Self::UnsupportedLedger(_) => StatusCode::ErrorUnsupportedLedger,
            Self::UnknownAgentAddress(_) => StatusCode::ErrorUnknownAgentAddress,
            Self::AgentNotReady(_) => StatusCode::ErrorAgentNotReady,
        }
    }

    /// Build the status reply for this error.
    pub fn to_status(&self) -> Status {
        Status::error(self.status_code(), self.to_string())
    }

    /// Rebuild an error from a non-success status received from a remote peer.
    ///
    /// Returns `None` for `SUCCESS`.
    pub fn from_status(status: &Status) -> Option<Self> {
        let msg = status.error_messages.join("; ");
        let err = match status.status_code {
            StatusCode::Success => return None,
            StatusCode::ErrorUnsupportedVersion => Self::UnsupportedVersion {
                expected: String::new(),
                found: msg,
            },
            StatusCode::ErrorUnexpectedPayload => Self::UnexpectedPayload(msg),
            StatusCode::ErrorGeneric => Self::Generic(msg),
            StatusCode::ErrorSerialization => Self::Serialization(msg),
            StatusCode::ErrorWrongAgentAddress => Self::WrongAgentAddress {
                expected: String::new(),
                found: msg,
            },
            StatusCode::ErrorWrongPublicKey => Self::WrongPublicKey {
                expected: String::new(),
                found: msg,
            },
            StatusCode::ErrorInvalidProof => Self::InvalidProof(msg),
            StatusCode::ErrorUnsupportedLedger => Self::UnsupportedLedger(msg),
            StatusCode::ErrorUnknownAgentAddress => Self::UnknownAgentAddress(msg),
            StatusCode::ErrorAgentNotReady => Self::AgentNotReady(msg),
        };
        Some(err)
    }
}

/// Alias for `Result<T, AcnError>`.
pub type AcnResult<T> = Result<T, AcnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_has_nonzero_code() {
        let errors = vec![
            AcnError::UnexpectedPayload("x".into()),
            AcnError::Generic("x".into()),
            AcnError::Serialization("x".into()),
            AcnError::InvalidProof("x".into()),
            AcnError::UnsupportedLedger("x".into()),
            AcnError::UnknownAgentAddress("x".into()),
            AcnError::AgentNotReady("x".into()),
            AcnError::Config("x".into()),
        ];
        for err in errors {
            let status = err.to_status();
            assert!(!status.is_success());
            assert_eq!(status.error_messages.len(), 1);
        }
    }

    #[test]
    fn test_status_roundtrip_keeps_code() {
        let err = AcnError::AgentNotReady("delegate offline".into());
        let back = AcnError::from_status(&err.to_status()).unwrap();
        assert_eq!(back.status_code(), StatusCode::ErrorAgentNotReady);
        assert!(AcnError::from_status(&Status::success()).is_none());
    }
}
