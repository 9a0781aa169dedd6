//! Storage node binary

use anyhow::Context;
use clap::Parser;
use ringkv::common::config::{Config, EvictionStrategy, NodeConfig};
use ringkv::common::NodeAddr;
use ringkv::NodeServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-node")]
#[command(about = "ringkv storage node")]
#[command(version = ringkv::BUILD_INFO)]
struct Cli {
    /// Address this node announces and listens on (host:port)
    #[arg(long)]
    addr: Option<NodeAddr>,

    /// Coordinator address (host:port)
    #[arg(long)]
    coordinator: Option<NodeAddr>,

    /// Data directory
    #[arg(long)]
    data: Option<PathBuf>,

    /// Cache capacity in entries
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// Cache eviction strategy
    #[arg(long, value_enum)]
    eviction: Option<EvictionStrategy>,

    /// Retry cap for replica forwarding
    #[arg(long)]
    forward_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let file_config = Config::load().node;
    let addr = cli
        .addr
        .or_else(|| file_config.as_ref().map(|c| c.addr.clone()))
        .context("--addr is required (or set [node].addr in ringkv.toml)")?;
    let coordinator = cli
        .coordinator
        .or_else(|| file_config.as_ref().map(|c| c.coordinator.clone()))
        .context("--coordinator is required (or set [node].coordinator in ringkv.toml)")?;

    let base = file_config.unwrap_or(NodeConfig {
        addr: addr.clone(),
        coordinator: coordinator.clone(),
        data_dir: PathBuf::from("./node-data"),
        cache_capacity: 100,
        eviction: EvictionStrategy::Fifo,
        forward_retries: 3,
    });

    let config = NodeConfig {
        addr,
        coordinator,
        data_dir: cli.data.unwrap_or(base.data_dir),
        cache_capacity: cli.cache_capacity.unwrap_or(base.cache_capacity),
        eviction: cli.eviction.unwrap_or(base.eviction),
        forward_retries: cli.forward_retries.unwrap_or(base.forward_retries),
    };

    NodeServer::new(config).serve().await?;
    Ok(())
}
