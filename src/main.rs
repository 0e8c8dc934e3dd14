//! # MerkleKV - Distributed Key-Value Store
//!
//! Bootstraps a node from a config file, connects to the configured MQTT
//! broker, and blocks until shutdown. The CLI itself is a thin wrapper —
//! all engine logic lives in the library crate.

use anyhow::{Context, Result};
use clap::Parser;
use merkle_kv::{Config, MerkleKvNode};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "merkle_kv", about = "A distributed, MQTT-replicated key-value store")]
struct Cli {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `node_id` from the config file.
    #[arg(long)]
    node_id: Option<String>,

    /// Overrides `client_id` from the config file.
    #[arg(long)]
    client_id: Option<String>,

    /// Disables replication regardless of the config file's
    /// `replication_access` setting.
    #[arg(long)]
    no_replication: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).context("loading configuration")?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }
    if cli.no_replication {
        config.replication_access = merkle_kv::config::ReplicationAccess::None;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        log::info!("starting node {config}");
        let node = MerkleKvNode::connect(config)?;
        node.start().await?;
        log::info!("node {} ready", node.node_id());

        tokio::signal::ctrl_c().await?;
        log::info!("shutdown signal received");
        node.shutdown().await?;
        Ok(())
    })
}
