//! Storage node server
//!
//! One TCP listener speaking the line protocol to clients, peers and the
//! coordinator. A node starts in the stopped state and serves client
//! traffic only after the coordinator signals `start_server`; peer and
//! control verbs are always dispatched so a stopped node can be
//! provisioned. Node state sits behind one async mutex, taken per
//! request and never held across network I/O.

use crate::common::ring::encode_ranges;
use crate::common::{
    Backoff, Error, NodeAddr, NodeConfig, PeerConnection, Request, Response, Result, RingMetadata,
    REPLICATION_FACTOR,
};
use crate::node::cache::CacheLayer;
use crate::node::replication::{
    plan_bootstrap, plan_transition, select_range, ReplicaOp, ReplicationManager, TopologyPlan,
};
use crate::node::store::FileStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

struct NodeState {
    cache: CacheLayer,
    metadata: RingMetadata,
    /// Not yet released for client traffic by the coordinator.
    stopped: bool,
    /// Hand-off in progress; writes are rejected, reads still served.
    write_locked: bool,
    /// Bumped on every metadata install; stale repair tasks check it
    /// before pruning.
    generation: u64,
}

#[derive(Clone)]
struct NodeHandle {
    addr: NodeAddr,
    state: Arc<Mutex<NodeState>>,
    replication: Arc<ReplicationManager>,
}

pub struct NodeServer {
    config: NodeConfig,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        tracing::info!("Starting storage node {} (v{})", self.config.addr, crate::VERSION);
        tracing::info!("  Coordinator: {}", self.config.coordinator);
        tracing::info!("  Data path: {}", self.config.data_dir.display());
        tracing::info!(
            "  Cache: {} entries, {:?} eviction",
            self.config.cache_capacity,
            self.config.eviction
        );

        let store = FileStore::open(&self.config.data_dir)?;
        let cache = CacheLayer::new(
            Box::new(store),
            self.config.cache_capacity,
            self.config.eviction,
        );
        if !cache.is_empty() {
            tracing::info!("  Recovered {} durable entries", cache.len());
        }
        let handle = NodeHandle {
            addr: self.config.addr.clone(),
            state: Arc::new(Mutex::new(NodeState {
                cache,
                metadata: RingMetadata::default(),
                stopped: true,
                write_locked: false,
                generation: 0,
            })),
            replication: Arc::new(ReplicationManager::new(self.config.forward_retries)),
        };

        let listener = tokio::net::TcpListener::bind((
            self.config.addr.host.as_str(),
            self.config.addr.port,
        ))
        .await?;

        // registration triggers coordinator pushes back to this node, so
        // the accept loop must already be running when it happens
        let reg_config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = register_with_coordinator(&reg_config).await {
                tracing::error!("Registration failed: {}", e);
            }
        });
        tracing::info!("✓ Storage node ready (awaiting start signal)");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle.run_connection(stream).await {
                            tracing::debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received, leaving the ring");
                    if let Err(e) = graceful_leave(&self.config, &handle).await {
                        tracing::warn!("Graceful leave incomplete: {}", e);
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Announce this node to the coordinator, retrying while it comes up.
async fn register_with_coordinator(config: &NodeConfig) -> Result<()> {
    let mut backoff = Backoff::default();
    let mut attempt = 0;
    loop {
        let outcome = async {
            let mut conn = PeerConnection::open(&config.coordinator).await?;
            conn.request(&Request::Register {
                addr: config.addr.clone(),
            })
            .await
        }
        .await;

        match outcome {
            Ok(Response::Ack) => {
                tracing::info!("Registered with coordinator {}", config.coordinator);
                return Ok(());
            }
            Ok(other) => {
                return Err(Error::Protocol(format!(
                    "coordinator rejected registration: {}",
                    other
                )))
            }
            Err(err) if attempt < 10 => {
                attempt += 1;
                tracing::debug!(
                    "Coordinator not reachable ({}), retrying registration",
                    err
                );
                backoff.wait().await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deregister and push still-owned data to the successor named by the
/// coordinator.
async fn graceful_leave(config: &NodeConfig, handle: &NodeHandle) -> Result<()> {
    let mut conn = PeerConnection::open(&config.coordinator).await?;
    let reply = conn
        .request(&Request::Deregister {
            addr: config.addr.clone(),
        })
        .await?;

    let target = match reply {
        Response::SetWriteLock { target, .. } => target,
        other => {
            return Err(Error::Protocol(format!(
                "unexpected deregister reply: {}",
                other
            )))
        }
    };

    let owned = {
        let mut state = handle.state.lock().await;
        state.write_locked = true;
        let entries = state.cache.entries()?;
        match state.metadata.range_of(&handle.addr) {
            Some(range) => select_range(&entries, range.lower, range.upper, true),
            None => Vec::new(),
        }
    };

    match target {
        Some(target) if !owned.is_empty() => {
            tracing::info!("Handing {} keys to {}", owned.len(), target);
            handle.replication.send_entries(&target, &owned).await?;
        }
        Some(_) => {}
        None => tracing::info!("Sole node leaving, nothing to transfer"),
    }
    Ok(())
}

impl NodeHandle {
    async fn run_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            let response = match Request::parse(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => Response::Error(err.to_string()),
            };
            write_half
                .write_all(format!("{}\r\n", response).as_bytes())
                .await?;
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Ack,
            Request::Put { key, value } => self.client_put(&key, value).await,
            Request::Get { key } => self.client_get(&key).await,
            Request::Delete { key } => self.client_delete(&key).await,
            Request::PutHash { key, value } => self.peer_put(key, value).await,
            Request::DeleteHash { key } => self.peer_delete(key).await,
            Request::Keyrange => self.keyrange(false).await,
            Request::KeyrangeRead => self.keyrange(true).await,
            Request::Metadata { ranges } => self.install_metadata(&ranges).await,
            Request::SetWriteLock { target, shutdown } => {
                self.set_write_lock(target, shutdown).await
            }
            Request::StartServer => self.start_serving().await,
            Request::Register { .. } | Request::Deregister { .. } => {
                Response::Error("not a coordinator".into())
            }
        }
    }

    async fn client_put(&self, key: &str, value: String) -> Response {
        let hash = crate::common::digest_key(key);
        let (existed, fan_out) = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Response::ServerStopped;
            }
            if state.write_locked {
                return Response::ServerWriteLock;
            }
            if !self.owns_for_write(&state, hash) {
                return Response::ServerNotResponsible;
            }
            let existed = match state.cache.put(hash, value.clone()) {
                Ok(existed) => existed,
                Err(err) => return Response::PutError(format!("{} {}", key, err)),
            };
            (existed, self.fan_out_targets(&state))
        };

        self.replication
            .spawn_fan_out(ReplicaOp::Put { hash, value }, fan_out);

        if existed {
            Response::PutUpdate(key.to_string())
        } else {
            Response::PutSuccess(key.to_string())
        }
    }

    async fn client_get(&self, key: &str) -> Response {
        let hash = crate::common::digest_key(key);
        let mut state = self.state.lock().await;
        if state.stopped {
            return Response::ServerStopped;
        }
        // reads are served from the replica set, and stay available
        // while a hand-off holds the write lock
        if !self.holds_for_read(&state, hash) {
            return Response::ServerNotResponsible;
        }
        match state.cache.get(hash) {
            Ok(Some(value)) => Response::GetSuccess {
                key: key.to_string(),
                value,
            },
            Ok(None) => Response::GetError(key.to_string()),
            Err(err) => Response::Error(format!("get {}: {}", key, err)),
        }
    }

    async fn client_delete(&self, key: &str) -> Response {
        let hash = crate::common::digest_key(key);
        let (existed, fan_out) = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Response::ServerStopped;
            }
            if state.write_locked {
                return Response::ServerWriteLock;
            }
            if !self.owns_for_write(&state, hash) {
                return Response::ServerNotResponsible;
            }
            let existed = match state.cache.delete(hash) {
                Ok(existed) => existed,
                Err(err) => return Response::Error(format!("delete {}: {}", key, err)),
            };
            (existed, self.fan_out_targets(&state))
        };

        if !existed {
            return Response::DeleteError(key.to_string());
        }
        self.replication
            .spawn_fan_out(ReplicaOp::Delete { hash }, fan_out);
        Response::DeleteSuccess(key.to_string())
    }

    /// Peer write path: the key is pre-hashed and range checks are
    /// skipped, since transfers intentionally place data ahead of (or
    /// outside) the receiver's current ranges. Only the write lock is
    /// honored.
    async fn peer_put(&self, hash: u128, value: String) -> Response {
        let mut state = self.state.lock().await;
        if state.write_locked {
            return Response::ServerWriteLock;
        }
        match state.cache.put(hash, value) {
            Ok(true) => Response::PutUpdate(format!("{:032x}", hash)),
            Ok(false) => Response::PutSuccess(format!("{:032x}", hash)),
            Err(err) => Response::PutError(format!("{:032x} {}", hash, err)),
        }
    }

    async fn peer_delete(&self, hash: u128) -> Response {
        let mut state = self.state.lock().await;
        if state.write_locked {
            return Response::ServerWriteLock;
        }
        match state.cache.delete(hash) {
            Ok(true) => Response::DeleteSuccess(format!("{:032x}", hash)),
            Ok(false) => Response::DeleteError(format!("{:032x}", hash)),
            Err(err) => Response::Error(format!("delete {:032x}: {}", hash, err)),
        }
    }

    async fn keyrange(&self, read: bool) -> Response {
        let state = self.state.lock().await;
        if state.stopped {
            return Response::ServerStopped;
        }
        if read {
            Response::KeyrangeReadSuccess(encode_ranges(&state.metadata.read_ranges()))
        } else {
            Response::KeyrangeSuccess(state.metadata.encode())
        }
    }

    /// Install a ring snapshot pushed by the coordinator, then repair
    /// replication in the background: push entries the new successors
    /// lack, and prune entries outside the new read range once every
    /// push succeeded.
    async fn install_metadata(&self, ranges: &str) -> Response {
        let new = match RingMetadata::decode(ranges) {
            Ok(metadata) => metadata,
            Err(err) => return Response::Error(err.to_string()),
        };

        let (plan, generation) = {
            let mut state = self.state.lock().await;
            let entries = match state.cache.entries() {
                Ok(entries) => entries,
                Err(err) => return Response::Error(err.to_string()),
            };
            let plan = plan_transition(&self.addr, &state.metadata, &new, &entries);
            state.metadata = new;
            state.generation += 1;
            (plan, state.generation)
        };

        if !plan.is_empty() {
            let handle = self.clone();
            tokio::spawn(async move {
                handle.repair(plan, generation).await;
            });
        }
        Response::Ack
    }

    /// Accept client traffic, then seed the successors with the write
    /// range this node just took over.
    async fn start_serving(&self) -> Response {
        let plan = {
            let mut state = self.state.lock().await;
            state.stopped = false;
            let entries = match state.cache.entries() {
                Ok(entries) => entries,
                Err(err) => return Response::Error(err.to_string()),
            };
            plan_bootstrap(&self.addr, &state.metadata, &entries)
        };
        tracing::info!("Released for client traffic");

        if !plan.is_empty() {
            let handle = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.run_transfers(&plan).await {
                    tracing::warn!("Bootstrap replication incomplete: {}", err);
                }
            });
        }
        Response::Ack
    }

    /// Stream the planned transfers, re-reading each key right before it
    /// leaves so a client write that landed after planning is never
    /// rolled back on the replica. Keys deleted since planning are
    /// skipped.
    async fn run_transfers(&self, plan: &TopologyPlan) -> Result<()> {
        for transfer in &plan.transfers {
            let entries = self.refresh_entries(&transfer.entries).await;
            if entries.is_empty() {
                continue;
            }
            tracing::debug!(
                "Replica repair: {} -> {} ({} entries)",
                self.addr,
                transfer.target,
                entries.len()
            );
            self.replication
                .send_entries(&transfer.target, &entries)
                .await?;
        }
        Ok(())
    }

    /// Latest committed values for a set of planned entries.
    async fn refresh_entries(&self, planned: &[(u128, String)]) -> Vec<(u128, String)> {
        let mut state = self.state.lock().await;
        let mut current = Vec::with_capacity(planned.len());
        for (hash, _) in planned {
            match state.cache.get(*hash) {
                Ok(Some(value)) => current.push((*hash, value)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("Failed to re-read {:032x} for transfer: {}", hash, err);
                }
            }
        }
        current
    }

    async fn repair(&self, plan: TopologyPlan, generation: u64) {
        if let Err(err) = self.run_transfers(&plan).await {
            // keep the out-of-range entries; the next snapshot install
            // re-plans from what is still on disk
            tracing::warn!("Replica repair failed, keeping local copies: {}", err);
            return;
        }
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        for hash in &plan.prune {
            if let Err(err) = state.cache.delete(*hash) {
                tracing::warn!("Failed to prune {:032x}: {}", hash, err);
            }
        }
        if !plan.prune.is_empty() {
            tracing::debug!("Pruned {} out-of-range entries", plan.prune.len());
        }
    }

    /// Join hand-off, driven by the coordinator after it broadcast the
    /// grown ring: lock writes, stream every entry outside the shrunk
    /// write range to the joining node, release it for traffic, unlock.
    /// With `shutdown` set this is a final drain toward `target` instead.
    async fn set_write_lock(&self, target: Option<NodeAddr>, shutdown: bool) -> Response {
        let target = match target {
            Some(target) => target,
            None => {
                let mut state = self.state.lock().await;
                state.write_locked = true;
                return Response::Ack;
            }
        };

        let outgoing = {
            let mut state = self.state.lock().await;
            state.write_locked = true;
            let entries = match state.cache.entries() {
                Ok(entries) => entries,
                Err(err) => {
                    state.write_locked = false;
                    return Response::Error(err.to_string());
                }
            };
            match state.metadata.range_of(&self.addr) {
                Some(range) if !shutdown => {
                    select_range(&entries, range.lower, range.upper, false)
                }
                _ => entries,
            }
        };

        let result = self.hand_off(&target, &outgoing, shutdown).await;

        if !shutdown {
            let mut state = self.state.lock().await;
            if result.is_ok() {
                // transferred entries we no longer replicate leave with
                // the transfer; this is the only path that may drop the
                // last local copy, and only after the target has it
                let read_ranges = state.metadata.read_ranges();
                let still_ours = read_ranges.iter().find(|r| r.addr == self.addr).cloned();
                for (hash, _) in &outgoing {
                    let keep = still_ours.as_ref().is_some_and(|r| r.contains(*hash));
                    if !keep {
                        if let Err(err) = state.cache.delete(*hash) {
                            tracing::warn!("Failed to drop {:032x} after hand-off: {}", hash, err);
                        }
                    }
                }
            }
            state.write_locked = false;
        }

        match result {
            Ok(()) => Response::Ack,
            Err(err) => {
                tracing::warn!("Hand-off to {} failed: {}", target, err);
                Response::Error(err.to_string())
            }
        }
    }

    async fn hand_off(
        &self,
        target: &NodeAddr,
        entries: &[(u128, String)],
        shutdown: bool,
    ) -> Result<()> {
        if !entries.is_empty() {
            tracing::info!("Hand-off: {} entries -> {}", entries.len(), target);
            self.replication.send_entries(target, entries).await?;
        }
        if !shutdown {
            // the joining node is provisioned; release it for traffic
            let mut conn = PeerConnection::open(target).await?;
            match conn.request(&Request::StartServer).await? {
                Response::Ack => Ok(()),
                other => Err(Error::Protocol(format!(
                    "start_server rejected by {}: {}",
                    target, other
                ))),
            }
        } else {
            Ok(())
        }
    }

    fn owns_for_write(&self, state: &NodeState, hash: u128) -> bool {
        state
            .metadata
            .range_of(&self.addr)
            .is_some_and(|range| range.contains(hash))
    }

    fn holds_for_read(&self, state: &NodeState, hash: u128) -> bool {
        state
            .metadata
            .read_ranges()
            .iter()
            .any(|range| range.addr == self.addr && range.contains(hash))
    }

    fn fan_out_targets(&self, state: &NodeState) -> Vec<NodeAddr> {
        if state.metadata.len() < REPLICATION_FACTOR {
            return Vec::new();
        }
        (1..REPLICATION_FACTOR)
            .filter_map(|k| state.metadata.successor(&self.addr, k))
            .map(|range| range.addr.clone())
            .filter(|addr| addr != &self.addr)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::EvictionStrategy;
    use crate::node::store::MemStore;

    fn handle() -> NodeHandle {
        let cache = CacheLayer::new(Box::new(MemStore::new()), 16, EvictionStrategy::Lru);
        NodeHandle {
            addr: NodeAddr::new("127.0.0.1", 7100),
            state: Arc::new(Mutex::new(NodeState {
                cache,
                metadata: RingMetadata::default(),
                stopped: true,
                write_locked: false,
                generation: 0,
            })),
            replication: Arc::new(ReplicationManager::new(3)),
        }
    }

    #[tokio::test]
    async fn test_transfer_entries_reread_at_send_time() {
        let handle = handle();
        {
            let mut state = handle.state.lock().await;
            state.cache.put(1, "old".into()).unwrap();
            state.cache.put(2, "doomed".into()).unwrap();
        }
        // a repair plan captured before the writes below landed
        let planned = vec![(1u128, "old".to_string()), (2, "doomed".to_string())];
        {
            let mut state = handle.state.lock().await;
            state.cache.put(1, "new".into()).unwrap();
            state.cache.delete(2).unwrap();
        }

        // the stream must carry the committed value, not the planned
        // one, and drop the key deleted since planning
        let current = handle.refresh_entries(&planned).await;
        assert_eq!(current, vec![(1, "new".to_string())]);
    }
}
