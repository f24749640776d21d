//! Configuration loading from `~/.acn/config.toml` with defaults.
//!
//! Environment variables override the file: `ACN_LISTEN_ADDR`,
//! `ACN_DELEGATE_ADDR`, `ACN_BOOTSTRAP_PEERS` (comma separated) and
//! `ACN_PRIVATE_KEY`.

use acn_types::NodeConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load node configuration from a TOML file, with defaults, then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let mut config = read_config_file(&config_path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn read_config_file(config_path: &Path) -> NodeConfig {
    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Apply `ACN_*` overrides read through `lookup`.
///
/// Unparseable values are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut NodeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("ACN_LISTEN_ADDR") {
        match value.trim().parse::<SocketAddr>() {
            Ok(addr) => config.listen_addr = addr,
            Err(e) => warn!(error = %e, value = %value, "Ignoring invalid ACN_LISTEN_ADDR"),
        }
    }
    if let Some(value) = lookup("ACN_DELEGATE_ADDR") {
        match value.trim().parse::<SocketAddr>() {
            Ok(addr) => config.delegate_addr = Some(addr),
            Err(e) => warn!(error = %e, value = %value, "Ignoring invalid ACN_DELEGATE_ADDR"),
        }
    }
    if let Some(value) = lookup("ACN_BOOTSTRAP_PEERS") {
        let parsed: Result<Vec<SocketAddr>, _> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect();
        match parsed {
            Ok(peers) => config.bootstrap_peers = peers,
            Err(e) => warn!(error = %e, "Ignoring invalid ACN_BOOTSTRAP_PEERS"),
        }
    }
    if let Some(value) = lookup("ACN_PRIVATE_KEY") {
        config.private_key = value.trim().to_string();
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    acn_home().join("config.toml")
}

/// Get the default ACN home directory.
pub fn acn_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".acn")
}
