//! Coordinator binary

use clap::Parser;
use ringkv::common::CoordinatorConfig;
use ringkv::Coordinator;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-coord")]
#[command(about = "ringkv membership coordinator")]
#[command(version = ringkv::BUILD_INFO)]
struct Cli {
    /// Bind address for node registrations
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Liveness probe interval in milliseconds
    #[arg(long)]
    probe_interval_ms: Option<u64>,

    /// Per-probe reply budget in milliseconds
    #[arg(long)]
    probe_timeout_ms: Option<u64>,
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
    let file_config = ringkv::common::config::Config::load();
    let mut config: CoordinatorConfig = file_config.coordinator.unwrap_or_default();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(interval) = cli.probe_interval_ms {
        config.probe_interval_ms = interval;
    }
    if let Some(timeout) = cli.probe_timeout_ms {
        config.probe_timeout_ms = timeout;
    }

    Coordinator::new(config).serve().await?;
    Ok(())
}
