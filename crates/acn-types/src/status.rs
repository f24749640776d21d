//! ACN status codes and the `Status` reply payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of an ACN exchange, serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusCode {
    Success,
    // generic
    ErrorUnsupportedVersion,
    ErrorUnexpectedPayload,
    ErrorGeneric,
    ErrorSerialization,
    // registration
    ErrorWrongAgentAddress,
    ErrorWrongPublicKey,
    ErrorInvalidProof,
    ErrorUnsupportedLedger,
    // lookup and delivery
    ErrorUnknownAgentAddress,
    ErrorAgentNotReady,
}

impl StatusCode {
    /// All defined codes, in wire order.
    pub const ALL: [StatusCode; 11] = [
        StatusCode::Success,
        StatusCode::ErrorUnsupportedVersion,
        StatusCode::ErrorUnexpectedPayload,
        StatusCode::ErrorGeneric,
        StatusCode::ErrorSerialization,
        StatusCode::ErrorWrongAgentAddress,
        StatusCode::ErrorWrongPublicKey,
        StatusCode::ErrorInvalidProof,
        StatusCode::ErrorUnsupportedLedger,
        StatusCode::ErrorUnknownAgentAddress,
        StatusCode::ErrorAgentNotReady,
    ];

    /// Integer value used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ErrorUnsupportedVersion => 1,
            Self::ErrorUnexpectedPayload => 2,
            Self::ErrorGeneric => 3,
            Self::ErrorSerialization => 4,
            Self::ErrorWrongAgentAddress => 10,
            Self::ErrorWrongPublicKey => 11,
            Self::ErrorInvalidProof => 12,
            Self::ErrorUnsupportedLedger => 13,
            Self::ErrorUnknownAgentAddress => 20,
            Self::ErrorAgentNotReady => 21,
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::ErrorUnsupportedVersion => "ERROR_UNSUPPORTED_VERSION",
            Self::ErrorUnexpectedPayload => "ERROR_UNEXPECTED_PAYLOAD",
            Self::ErrorGeneric => "ERROR_GENERIC",
            Self::ErrorSerialization => "ERROR_SERIALIZATION",
            Self::ErrorWrongAgentAddress => "ERROR_WRONG_AGENT_ADDRESS",
            Self::ErrorWrongPublicKey => "ERROR_WRONG_PUBLIC_KEY",
            Self::ErrorInvalidProof => "ERROR_INVALID_PROOF",
            Self::ErrorUnsupportedLedger => "ERROR_UNSUPPORTED_LEDGER",
            Self::ErrorUnknownAgentAddress => "ERROR_UNKNOWN_AGENT_ADDRESS",
            Self::ErrorAgentNotReady => "ERROR_AGENT_NOT_READY",
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> u8 {
        code.code()
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StatusCode::ALL
            .into_iter()
            .find(|c| c.code() == value)
            .ok_or_else(|| format!("unknown status code {value}"))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply payload for every request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub status_code: StatusCode,
    /// Human-readable reasons; empty on success.
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            status_code: StatusCode::Success,
            error_messages: Vec::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: code,
            error_messages: vec![message.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}
