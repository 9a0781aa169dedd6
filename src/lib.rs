//! # ringkv
//!
//! A partitioned, replicated key-value store:
//! - Consistent-hash ring over 128-bit BLAKE3 digests
//! - Triple replication with per-node repair after topology changes
//! - Membership coordinator with failure detection and guarded hand-off
//! - Bounded in-memory cache (FIFO/LRU/LFU) over a durable store
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────┐
//!                │       Coordinator        │
//!                │ membership + liveness    │
//!                │ probes + ring broadcast  │
//!                └───────────┬──────────────┘
//!                            │ control (line protocol)
//!            ┌───────────────┼───────────────┐
//!            │               │               │
//!      ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!      │  Node A   │──▶│  Node B   │──▶│  Node C   │──▶ (A)
//!      │ cache+disk│   │ cache+disk│   │ cache+disk│
//!      └───────────┘   └───────────┘   └───────────┘
//!        each write range is mirrored on the two successors
//! ```
//!
//! ## Usage
//!
//! ### Start the coordinator
//! ```bash
//! ringkv-coord --bind 0.0.0.0:5152
//! ```
//!
//! ### Start storage nodes
//! ```bash
//! ringkv-node --addr 127.0.0.1:7001 --coordinator 127.0.0.1:5152 \
//!   --data ./node1-data --cache-capacity 200 --eviction lru
//! ```
//!
//! ### Use the CLI
//! ```bash
//! ringkv --node 127.0.0.1:7001 put my-key "some value"
//! ringkv --node 127.0.0.1:7001 get my-key
//! ringkv --node 127.0.0.1:7001 delete my-key
//! ringkv --node 127.0.0.1:7001 keyrange
//! ```

pub mod client;
pub mod common;
pub mod coordinator;
pub mod node;

// Re-export commonly used types
pub use client::RequestRouter;
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use node::NodeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
