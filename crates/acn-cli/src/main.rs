//! `acn`: run an Agent Communication Network peer, generate keys and issue
//! agent records.

mod cli;

use crate::cli::*;
use acn_node::config::load_config;
use acn_node::PeerNode;
use acn_types::record::{self, derive_address, generate_signing_key, parse_signing_key, public_key_hex};
use acn_types::AgentRecord;
use anyhow::{bail, Context};
use clap::Parser;
use std::path::Path;
use zeroize::Zeroizing;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.log_json);

    let result = match cli.command {
        Commands::Run => cmd_run(cli.config.as_deref()),
        Commands::Keygen { json } => cmd_keygen(json),
        Commands::Record(sub) => match sub {
            RecordCommands::Issue {
                peer_public_key,
                agent_key,
                service_id,
                not_before,
                days,
                toml,
            } => cmd_record_issue(&peer_public_key, agent_key, &service_id, not_before, days, toml),
            RecordCommands::Verify {
                file,
                peer_public_key,
            } => cmd_record_verify(&file, peer_public_key.as_deref()),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn cmd_run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path);
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(async move {
        let node = PeerNode::start(config).await.context("peer failed to start")?;
        println!("ACN peer running");
        println!("  peer id:     {}", node.peer_id());
        println!("  public key:  {}", node.public_key());
        println!("  listening:   {}", node.public_addr());
        if let Some(addr) = node.delegate_addr() {
            println!("  delegate:    {addr}");
        }
        if let Some(addr) = node.agent_bridge_addr() {
            println!("  agent:       {addr}");
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        tracing::info!("Shutdown requested");
        let stats = node.stats();
        node.shutdown().await;
        tracing::info!(
            routed = stats.routed,
            forwarded = stats.forwarded,
            failed = stats.failed,
            "Peer stopped"
        );
        Ok(())
    })
}

fn cmd_keygen(json: bool) -> anyhow::Result<()> {
    let key = generate_signing_key();
    let private_hex = Zeroizing::new(hex::encode(key.to_bytes()));
    let verifying = key.verifying_key();
    let public = public_key_hex(&verifying);
    let peer_id = acn_node::handshake::peer_id_for(&public);
    let address = derive_address(&verifying);

    if json {
        let out = serde_json::json!({
            "private_key": private_hex.as_str(),
            "public_key": public,
            "peer_id": peer_id,
            "address": address,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("private_key = \"{}\"", private_hex.as_str());
        println!("# public key: {public}");
        println!("# peer id:    {peer_id}");
        println!("# address:    {address}");
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct RecordTable<'a> {
    agent_record: &'a AgentRecord,
}

fn issue_record(
    peer_public_key: &str,
    agent_key: Option<String>,
    service_id: &str,
    not_before: Option<chrono::NaiveDate>,
    days: u32,
) -> anyhow::Result<(AgentRecord, Option<Zeroizing<String>>)> {
    record::parse_public_key(peer_public_key).context("invalid --peer-public-key")?;
    if days == 0 {
        bail!("--days must be at least 1");
    }

    let (key, generated) = match agent_key.map(Zeroizing::new) {
        Some(hex_key) => (parse_signing_key(&hex_key).context("invalid --agent-key")?, None),
        None => {
            let key = generate_signing_key();
            let hex_key = Zeroizing::new(hex::encode(key.to_bytes()));
            (key, Some(hex_key))
        }
    };

    let not_before = not_before.unwrap_or_else(|| chrono::Utc::now().date_naive());
    let not_after = not_before + chrono::Duration::days(i64::from(days));
    let record = AgentRecord::issue(service_id, &key, peer_public_key, not_before, not_after);
    Ok((record, generated))
}

fn cmd_record_issue(
    peer_public_key: &str,
    agent_key: Option<String>,
    service_id: &str,
    not_before: Option<chrono::NaiveDate>,
    days: u32,
    as_toml: bool,
) -> anyhow::Result<()> {
    let (record, generated) = issue_record(peer_public_key, agent_key, service_id, not_before, days)?;
    if let Some(hex_key) = generated {
        eprintln!("Generated agent key (keep it secret): {}", hex_key.as_str());
    }
    if as_toml {
        print!("{}", toml::to_string(&RecordTable { agent_record: &record })?);
    } else {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}

fn cmd_record_verify(file: &Path, peer_public_key: Option<&str>) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let record: AgentRecord = serde_json::from_str(&contents).context("not an agent record")?;
    match record::verify(&record, Some(&record.address), peer_public_key) {
        Ok(()) => {
            println!("ok: {} represented by {}", record.address, record.peer_public_key);
            Ok(())
        }
        Err(e) => bail!("record rejected ({}): {e}", e.status_code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_record_verifies_for_peer() {
        let peer = generate_signing_key();
        let peer_hex = public_key_hex(&peer.verifying_key());
        let (record, generated) = issue_record(&peer_hex, None, "svc", None, 30).unwrap();
        assert!(generated.is_some());
        record::verify(&record, Some(&record.address), Some(&peer_hex)).unwrap();
        assert_eq!(record.service_id, "svc");
        assert_eq!((record.not_after - record.not_before).num_days(), 30);
    }

    #[test]
    fn test_issue_with_given_agent_key_keeps_address() {
        let peer = generate_signing_key();
        let agent = generate_signing_key();
        let (record, generated) = issue_record(
            &public_key_hex(&peer.verifying_key()),
            Some(hex::encode(agent.to_bytes())),
            "svc",
            None,
            1,
        )
        .unwrap();
        assert!(generated.is_none());
        assert_eq!(record.address, derive_address(&agent.verifying_key()));
    }

    #[test]
    fn test_issue_rejects_bad_input() {
        assert!(issue_record("not-hex", None, "svc", None, 1).is_err());
        let peer = public_key_hex(&generate_signing_key().verifying_key());
        assert!(issue_record(&peer, None, "svc", None, 0).is_err());
        assert!(issue_record(&peer, Some("zz".into()), "svc", None, 1).is_err());
    }

    #[test]
    fn test_toml_output_loads_as_config() {
        let peer = generate_signing_key();
        let (record, _) =
            issue_record(&public_key_hex(&peer.verifying_key()), None, "svc", None, 10).unwrap();
        let text = toml::to_string(&RecordTable { agent_record: &record }).unwrap();
        let config: acn_types::NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.agent_record, Some(record));
    }

    #[test]
    fn test_verify_command_reports_wrong_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let peer = generate_signing_key();
        let (record, _) =
            issue_record(&public_key_hex(&peer.verifying_key()), None, "svc", None, 10).unwrap();
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        assert!(cmd_record_verify(&path, None).is_ok());
        let other = public_key_hex(&generate_signing_key().verifying_key());
        assert!(cmd_record_verify(&path, Some(&other)).is_err());
    }
}
