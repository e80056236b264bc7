//! Elohim Replica Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (config.toml under the default storage directory)
//! elohim-replica
//!
//! # Start with a custom config
//! elohim-replica --config /path/to/config.toml
//!
//! # Two-node cluster
//! elohim-replica --storage-dir /data/a --addr 0.0.0.0:8080 --peer http://10.0.0.2:8080
//! elohim-replica --storage-dir /data/b --addr 0.0.0.0:8080 --peer http://10.0.0.1:8080
//! ```
//!
//! Log verbosity follows `RUST_LOG`, e.g. `RUST_LOG=elohim_replica=debug`.

use anyhow::Context;
use clap::Parser;
use elohim_replica::{Config, HttpServer, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-replica")]
#[command(about = "Peer-replicated, content-addressed file store")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_REPLICA_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ELOHIM_REPLICA_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(long)]
    addr: Option<String>,

    /// Peer node URL (repeatable); replaces the configured peer list
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Storage group, the first segment of download URLs
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_replica=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config: explicit path, else <storage_dir>/config.toml, else defaults
    let storage_dir = args
        .storage_dir
        .clone()
        .unwrap_or_else(elohim_replica::config::default_storage_dir);
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| storage_dir.join("config.toml"));
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }
    if let Some(group) = args.group {
        config.group = group;
    }

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("failed to create {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    config.normalize();
    let bind_addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    info!(
        storage_dir = %config.storage_dir.display(),
        addr = %bind_addr,
        host = %config.host,
        peers = ?config.peers,
        "Starting elohim-replica"
    );

    let node = Node::open_with_http(config)
        .await
        .context("failed to open node storage")?;
    node.start();

    let http_server = Arc::new(HttpServer::new(node.clone(), bind_addr));

    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    node.shutdown().await?;

    let rows = node.day_stats().await;
    if let Some(all) = rows.last() {
        info!(
            files = all.file_count,
            bytes = all.total_size,
            "Final storage stats"
        );
    }

    Ok(())
}
