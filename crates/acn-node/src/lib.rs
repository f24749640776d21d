//! Agent Communication Network (ACN) peer node.
//!
//! A peer lets agents exchange envelopes without a central broker. It keeps
//! a share of the network's address directory, verifies every agent record
//! it accepts, and routes each envelope to its local agent, to one of its
//! relay or delegate clients, or to the peer that represents the target.
//!
//! ## Architecture
//!
//! - **PeerNode**: binds the listeners, runs bootstrap and owns all state
//! - **AddressDirectory**: local tables plus remote lookups over connected peers
//! - **EnvelopeRouter**: the per-envelope routing decision
//! - **ClientRegistry**: relay and delegate clients with their live links
//! - **LocalAgentBridge**: line-based link to the directly attached agent
//! - **PeerTransport**: outbound requests to other peers (TCP + handshake)
//! - **AgentClient**: the client side of the relay and delegate services

pub mod bootstrap;
pub mod bridge;
pub mod client;
pub mod clients;
pub mod config;
pub mod directory;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod router;
mod service;
pub mod stats;
pub mod store;
pub mod transport;
pub mod wire;

pub use client::AgentClient;
pub use clients::{ClientKind, ClientRegistry, ClientState};
pub use directory::{AddressDirectory, Resolution, Route};
pub use handshake::{Channel, HandshakeOptions, NodeIdentity};
pub use message::{AcnMessage, Payload, PROTOCOL_VERSION};
pub use peer::{NodeError, PeerNode};
pub use registry::{PeerEntry, PeerRef, PeerRegistry};
pub use retry::RetryConfig;
pub use router::{EnvelopeRouter, RouteDecision};
pub use stats::StatsSnapshot;
pub use transport::{PeerTransport, TcpTransport};
pub use wire::WireError;
