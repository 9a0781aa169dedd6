//! Common utilities and types shared across ringkv

pub mod backoff;
pub mod config;
pub mod conn;
pub mod error;
pub mod proto;
pub mod ring;

pub use backoff::Backoff;
pub use config::{Config, CoordinatorConfig, EvictionStrategy, NodeConfig};
pub use conn::PeerConnection;
pub use error::{Error, Result};
pub use proto::{Request, Response};
pub use ring::{
    digest, digest_key, in_range, NodeAddr, Range, RingMetadata, REPLICATION_FACTOR,
};
