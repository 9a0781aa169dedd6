//! Liveness monitor
//!
//! Probes every member on a fixed interval. Probes run concurrently, so
//! a sweep costs one slow probe, not the sum of all of them. Nodes that
//! miss the reply budget are evicted; durability relies on the
//! replication the ring already performed, no data is pulled from a
//! dead node.

use crate::common::{CoordinatorConfig, NodeAddr, PeerConnection};
use crate::coordinator::server::{evict_failed, Membership};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub(crate) struct Monitor {
    membership: Arc<Mutex<Membership>>,
    config: CoordinatorConfig,
}

impl Monitor {
    pub(crate) fn new(membership: Arc<Mutex<Membership>>, config: CoordinatorConfig) -> Self {
        Self { membership, config }
    }

    pub(crate) fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let nodes = {
            let members = self.membership.lock().await;
            members.nodes.clone()
        };
        if nodes.is_empty() {
            return;
        }

        let timeout = self.config.probe_timeout();
        let probes = nodes.iter().map(|node| probe(node, timeout));
        let results = join_all(probes).await;

        let failed: Vec<NodeAddr> = nodes
            .into_iter()
            .zip(results)
            .filter(|(_, alive)| !alive)
            .map(|(node, _)| node)
            .collect();

        if !failed.is_empty() {
            evict_failed(&self.membership, &failed).await;
        }
    }
}

async fn probe(addr: &NodeAddr, timeout: Duration) -> bool {
    let attempt = async {
        let mut conn = PeerConnection::open(addr).await?;
        conn.ping().await
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Ok(())))
}
