//! Node configuration, deserialized from `~/.acn/config.toml`.
//!
//! Every field has a default so a partial file (or none at all) yields a
//! usable configuration; [`NodeConfig::validate`] catches what defaults
//! cannot fix.

use crate::error::{AcnError, AcnResult};
use crate::record::{self, AgentRecord};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum frame size accepted on any ACN stream (3 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 3 * 1024 * 1024;

/// Top-level peer node configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the native transport listens on.
    pub listen_addr: SocketAddr,
    /// Address advertised to other peers; defaults to the bound address.
    pub public_addr: Option<SocketAddr>,
    /// Plain-socket listener for delegate clients. Disabled when unset.
    pub delegate_addr: Option<SocketAddr>,
    /// Listener for the directly attached agent. Disabled when unset.
    pub agent_bridge_addr: Option<SocketAddr>,
    /// Hex-encoded Ed25519 secret key of this peer.
    pub private_key: String,
    /// Record of the directly attached agent.
    pub agent_record: Option<AgentRecord>,
    pub bootstrap_peers: Vec<SocketAddr>,
    /// Join attempts per bootstrap peer before it counts as unreachable.
    pub bootstrap_attempts: u32,
    /// Pre-shared admission secret. Peers without it are refused when set.
    pub network_secret: Option<String>,
    pub relay: RelayConfig,
    pub directory: DirectoryConfig,
    pub timeouts: TimeoutConfig,
    /// Pause before handling each client registration.
    pub registration_delay_ms: u64,
    /// Append-only file of relay client records, reloaded at startup.
    pub records_storage_path: Option<PathBuf>,
    pub max_frame_size: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            public_addr: None,
            delegate_addr: None,
            agent_bridge_addr: None,
            private_key: String::new(),
            agent_record: None,
            bootstrap_peers: Vec::new(),
            bootstrap_attempts: 3,
            network_secret: None,
            relay: RelayConfig::default(),
            directory: DirectoryConfig::default(),
            timeouts: TimeoutConfig::default(),
            registration_delay_ms: 0,
            records_storage_path: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("listen_addr", &self.listen_addr)
            .field("public_addr", &self.public_addr)
            .field("delegate_addr", &self.delegate_addr)
            .field("agent_bridge_addr", &self.agent_bridge_addr)
            .field("private_key", &"<redacted>")
            .field("agent_record", &self.agent_record.as_ref().map(|r| &r.address))
            .field("bootstrap_peers", &self.bootstrap_peers)
            .field("bootstrap_attempts", &self.bootstrap_attempts)
            .field("network_secret", &self.network_secret.as_ref().map(|_| "<redacted>"))
            .field("relay", &self.relay)
            .field("directory", &self.directory)
            .field("timeouts", &self.timeouts)
            .field("registration_delay_ms", &self.registration_delay_ms)
            .field("records_storage_path", &self.records_storage_path)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl NodeConfig {
    /// Check the configuration for errors defaults cannot repair.
    pub fn validate(&self) -> AcnResult<()> {
        let key = record::parse_signing_key(&self.private_key)?;
        let peer_key = record::public_key_hex(&key.verifying_key());

        if let Some(agent) = &self.agent_record {
            record::verify(agent, Some(&agent.address), Some(&peer_key)).map_err(|e| {
                AcnError::Config(format!("agent_record does not verify for this peer: {e}"))
            })?;
        }
        if self.relay.enabled && self.relay.capacity == 0 {
            return Err(AcnError::Config(
                "relay.capacity must be positive when relay is enabled".into(),
            ));
        }
        if self.max_frame_size < 1024 {
            return Err(AcnError::Config(format!(
                "max_frame_size {} is below the 1024 byte minimum",
                self.max_frame_size
            )));
        }
        let t = &self.timeouts;
        if t.status_ms <= t.agent_ready_ms.saturating_add(t.new_stream_ms) {
            return Err(AcnError::Config(format!(
                "timeouts.status_ms ({}) must exceed agent_ready_ms + new_stream_ms ({})",
                t.status_ms,
                t.agent_ready_ms.saturating_add(t.new_stream_ms)
            )));
        }
        if self.directory.negative_ttl_secs > self.directory.entry_ttl_secs {
            return Err(AcnError::Config(
                "directory.negative_ttl_secs must not exceed directory.entry_ttl_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn registration_delay(&self) -> Duration {
        Duration::from_millis(self.registration_delay_ms)
    }
}

/// Relay service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Maximum number of relay clients held at once.
    pub capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
        }
    }
}

/// Address directory cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Lifetime of a cached remote entry.
    pub entry_ttl_secs: u64,
    /// How long a failed resolution is remembered.
    pub negative_ttl_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: 3600,
            negative_ttl_secs: 5,
        }
    }
}

impl DirectoryConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

/// Bounds on every suspension point of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Remote address lookup.
    pub lookup_ms: u64,
    /// Opening a stream to another peer, handshake included.
    pub new_stream_ms: u64,
    /// Waiting for a bootstrap peer to confirm insertion.
    pub join_ack_ms: u64,
    /// Waiting for the local agent or a client to accept a delivery.
    pub agent_ready_ms: u64,
    /// Waiting for a Status reply after sending a request. Must exceed
    /// `agent_ready_ms + new_stream_ms` so the answering peer reports its own
    /// delivery outcome before the sender gives up.
    pub status_ms: u64,
    /// Idle time after which a disconnected client entry is dropped.
    pub client_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lookup_ms: 20_000,
            new_stream_ms: 5_000,
            join_ack_ms: 5_000,
            agent_ready_ms: 5_000,
            status_ms: 15_000,
            client_idle_secs: 3600,
        }
    }
}

impl TimeoutConfig {
    pub fn lookup(&self) -> Duration {
        Duration::from_millis(self.lookup_ms)
    }

    pub fn new_stream(&self) -> Duration {
        Duration::from_millis(self.new_stream_ms)
    }

    pub fn join_ack(&self) -> Duration {
        Duration::from_millis(self.join_ack_ms)
    }

    pub fn agent_ready(&self) -> Duration {
        Duration::from_millis(self.agent_ready_ms)
    }

    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }

    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{generate_signing_key, public_key_hex};
    use chrono::{Duration as ChronoDuration, Utc};

    fn keyed_config() -> (NodeConfig, ed25519_dalek::SigningKey) {
        let key = generate_signing_key();
        let config = NodeConfig {
            private_key: hex::encode(key.to_bytes()),
            ..Default::default()
        };
        (config, key)
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
listen_addr = "127.0.0.1:9100"
bootstrap_peers = ["127.0.0.1:9000"]

[timeouts]
lookup_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.bootstrap_peers.len(), 1);
        assert_eq!(config.timeouts.lookup_ms, 500);
        assert_eq!(config.timeouts.new_stream_ms, 5_000);
        assert!(config.relay.enabled);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_validate_requires_key() {
        let err = NodeConfig::default().validate().unwrap_err();
        assert!(matches!(err, AcnError::Config(_)));
    }

    #[test]
    fn test_validate_agent_record_against_node_key() {
        let (mut config, key) = keyed_config();
        let today = Utc::now().date_naive();
        let agent = generate_signing_key();
        config.agent_record = Some(AgentRecord::issue(
            "acn",
            &agent,
            public_key_hex(&key.verifying_key()),
            today - ChronoDuration::days(1),
            today + ChronoDuration::days(30),
        ));
        assert!(config.validate().is_ok());

        let other_peer = generate_signing_key();
        config.agent_record = Some(AgentRecord::issue(
            "acn",
            &agent,
            public_key_hex(&other_peer.verifying_key()),
            today - ChronoDuration::days(1),
            today + ChronoDuration::days(30),
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_relay_capacity() {
        let (mut config, _) = keyed_config();
        config.relay.capacity = 0;
        assert!(config.validate().is_err());
        config.relay.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_status_outlasts_remote_delivery() {
        let (mut config, _) = keyed_config();
        assert!(config.validate().is_ok());

        config.timeouts.status_ms = config.timeouts.agent_ready_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("status_ms"));

        config.timeouts.agent_ready_ms = 100;
        config.timeouts.new_stream_ms = 100;
        config.timeouts.status_ms = 201;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let (mut config, _) = keyed_config();
        config.network_secret = Some("hunter2".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains(&config.private_key));
        assert!(!rendered.contains("hunter2"));
    }
}
