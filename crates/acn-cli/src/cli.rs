//! Clap CLI definitions for the `acn` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  acn keygen                                Generate a peer key
  acn record issue --peer-public-key <hex>  Issue a record for a new agent
  acn run --config peer.toml                Run a peer node";

/// Agent Communication Network peer node.
#[derive(Parser)]
#[command(name = "acn", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default `~/.acn/config.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a peer node until Ctrl+C.
    Run,
    /// Generate an Ed25519 key pair.
    Keygen {
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
    },
    /// Manage agent records [*].
    #[command(subcommand)]
    Record(RecordCommands),
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Issue a record binding an agent key to the peer that represents it.
    Issue {
        /// Hex public key of the representing peer.
        #[arg(long)]
        peer_public_key: String,
        /// Hex private key of the agent (a new one is generated if omitted).
        #[arg(long)]
        agent_key: Option<String>,
        /// Service identifier stored in the record.
        #[arg(long, default_value = "acn")]
        service_id: String,
        /// First valid day (YYYY-MM-DD, default today).
        #[arg(long)]
        not_before: Option<chrono::NaiveDate>,
        /// Number of days the record stays valid.
        #[arg(long, default_value_t = 365)]
        days: u32,
        /// Print an `[agent_record]` table ready to paste into a config file.
        #[arg(long)]
        toml: bool,
    },
    /// Verify a record file against an expected peer key.
    Verify {
        /// JSON file holding the record.
        file: PathBuf,
        /// Hex public key of the peer expected to represent the agent.
        #[arg(long)]
        peer_public_key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_record_issue() {
        let cli = Cli::try_parse_from([
            "acn",
            "record",
            "issue",
            "--peer-public-key",
            "ab",
            "--days",
            "7",
            "--not-before",
            "2026-01-02",
        ])
        .unwrap();
        match cli.command {
            Commands::Record(RecordCommands::Issue {
                peer_public_key,
                days,
                not_before,
                toml,
                ..
            }) => {
                assert_eq!(peer_public_key, "ab");
                assert_eq!(days, 7);
                assert_eq!(not_before.unwrap().to_string(), "2026-01-02");
                assert!(!toml);
            }
            _ => panic!("expected record issue"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["acn", "run", "--log-json", "--config", "/tmp/p.toml"]).unwrap();
        assert!(cli.log_json);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/p.toml"));
        assert!(matches!(cli.command, Commands::Run));
    }
}
