//! Chukcha - Distributed Append-Only Message Log
//!
//! Starts a single chukcha instance: registers it with the discovery
//! registry, replicates the chunks of its peers and serves the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chukcha::config::NodeConfig;
use chukcha::error::Result;
use chukcha::node::{self, InitArgs};
use chukcha::registry::EtcdRegistry;

/// Chukcha - distributed, replicated, append-only message log
#[derive(Parser)]
#[command(name = "chukcha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file; flags override file values
    #[arg(long)]
    config: Option<PathBuf>,

    /// The name of the cluster (must be set if several chukcha clusters
    /// share a single etcd installation)
    #[arg(long)]
    cluster: Option<String>,

    /// The unique instance name
    #[arg(long)]
    instance: Option<String>,

    /// The directory where the chunk data is stored
    #[arg(long)]
    dirname: Option<PathBuf>,

    /// Network address to listen on
    #[arg(long)]
    listen: Option<String>,

    /// Comma-separated etcd endpoints
    #[arg(long)]
    etcd: Option<String>,

    /// Maximum chunk size in bytes
    #[arg(long)]
    max_chunk_size: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(cluster) = cli.cluster {
        config.cluster = cluster;
    }
    if let Some(instance) = cli.instance {
        config.instance = instance;
    }
    if let Some(dirname) = cli.dirname {
        config.dirname = dirname;
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(etcd) = cli.etcd {
        config.etcd = etcd
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(max_chunk_size) = cli.max_chunk_size {
        config.max_chunk_size = max_chunk_size;
    }
    config.validate()?;

    let registry = EtcdRegistry::connect(&config.etcd).await?;

    let node = node::start(InitArgs {
        registry: Arc::new(registry),
        cluster_name: config.cluster.clone(),
        instance_name: config.instance.clone(),
        dirname: config.dirname.clone(),
        listen_addr: config.listen_addr.clone(),
        max_chunk_size: config.max_chunk_size,
        peer_lease_ttl: config.peer_lease_ttl(),
        disable_acknowledge: false,
    })
    .await?;

    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = shutdown.send(true);
        }
    });

    node.wait().await
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
