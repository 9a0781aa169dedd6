//! Configuration for ringkv components

use crate::common::ring::NodeAddr;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration, loadable from `ringkv.toml` and overridable from
/// the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage-node config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Coordinator config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `ringkv.toml` (if present) and `RINGKV_*` environment
    /// variables; absent or unreadable sources fall back to defaults.
    pub fn load() -> Self {
        config::Config::builder()
            .add_source(config::File::with_name("ringkv").required(false))
            .add_source(config::Environment::with_prefix("RINGKV").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap_or_default()
    }
}

/// Cache eviction strategy, selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Fifo,
    Lru,
    Lfu,
}

/// Storage-node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address this node announces and listens on
    pub addr: NodeAddr,

    /// Coordinator address
    pub coordinator: NodeAddr,

    /// Directory holding the durable store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of entries the in-memory cache holds
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Eviction strategy for the cache
    #[serde(default = "default_eviction")]
    pub eviction: EvictionStrategy,

    /// Retry cap for replica write forwarding
    #[serde(default = "default_forward_retries")]
    pub forward_retries: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./node-data")
}
fn default_cache_capacity() -> usize {
    100
}
fn default_eviction() -> EvictionStrategy {
    EvictionStrategy::Fifo
}
fn default_forward_retries() -> u32 {
    3
}

impl NodeConfig {
    /// Startup validation; violations abort the process before serving.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfig("cache capacity must be >= 1".into()));
        }
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            Error::InvalidConfig(format!(
                "cannot create data directory {}: {}",
                self.data_dir.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for node registrations
    #[serde(default = "default_coord_bind")]
    pub bind_addr: SocketAddr,

    /// Liveness probe cycle interval
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Per-probe reply budget
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_coord_bind() -> SocketAddr {
    "0.0.0.0:5152".parse().unwrap()
}
fn default_probe_interval() -> u64 {
    1000
}
fn default_probe_timeout() -> u64 {
    700
}

impl CoordinatorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_coord_bind(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}
