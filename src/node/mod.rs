//! Storage node: cache, durable store, replication and the TCP server

pub mod cache;
pub mod replication;
pub mod server;
pub mod store;

pub use cache::{CacheLayer, EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy};
pub use replication::{
    plan_bootstrap, plan_transition, select_range, ReplicationManager, TopologyPlan,
};
pub use server::NodeServer;
pub use store::{DurableStore, FileStore, MemStore};
