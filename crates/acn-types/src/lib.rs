//! Core types for the Agent Communication Network (ACN).
//!
//! This crate defines the data shared by every ACN participant: signed agent
//! records and their verifier, status codes, routed envelopes and node
//! configuration. It performs no I/O.

pub mod base64_bytes;
pub mod config;
pub mod envelope;
pub mod error;
pub mod record;
pub mod status;

pub use config::NodeConfig;
pub use envelope::Envelope;
pub use error::{AcnError, AcnResult};
pub use record::AgentRecord;
pub use status::{Status, StatusCode};
