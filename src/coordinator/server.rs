//! Membership coordinator
//!
//! Tracks the set of live storage nodes, recomputes the ring on every
//! change and pushes the snapshot to all members. Join and leave drive
//! the write-lock-guarded hand-off. Registrations are processed under
//! one mutex held across the whole hand-off, so no two hand-offs ever
//! target the same shrinking node at once.

use crate::common::{
    Backoff, CoordinatorConfig, Error, NodeAddr, PeerConnection, Request, Response, Result,
    RingMetadata,
};
use crate::coordinator::monitor::Monitor;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[derive(Default)]
pub(crate) struct Membership {
    pub(crate) nodes: Vec<NodeAddr>,
}

impl Membership {
    pub(crate) fn ring(&self) -> RingMetadata {
        RingMetadata::compute(&self.nodes)
    }

    fn add(&mut self, addr: NodeAddr) -> bool {
        if self.nodes.contains(&addr) {
            return false;
        }
        self.nodes.push(addr);
        true
    }

    fn remove(&mut self, addr: &NodeAddr) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n != addr);
        self.nodes.len() != before
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    membership: Arc<Mutex<Membership>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            membership: Arc::new(Mutex::new(Membership::default())),
        }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting coordinator (v{})", crate::VERSION);
        tracing::info!("  Bind: {}", self.config.bind_addr);
        tracing::info!(
            "  Probes: every {:?}, {:?} timeout",
            self.config.probe_interval(),
            self.config.probe_timeout()
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        let monitor = Monitor::new(self.membership.clone(), self.config.clone());
        let _monitor_handle = monitor.start();

        tracing::info!("✓ Coordinator ready");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let membership = self.membership.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(membership, stream).await {
                            tracing::debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Coordinator shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn run_connection(membership: Arc<Mutex<Membership>>, stream: TcpStream) -> Result<()> {
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
            Ok(Request::Register { addr }) => register(&membership, addr).await,
            Ok(Request::Deregister { addr }) => deregister(&membership, &addr).await,
            Ok(Request::Ping) => Response::Ack,
            Ok(other) => Response::Error(format!("not supported here: {}", other)),
            Err(err) => Response::Error(err.to_string()),
        };
        write_half
            .write_all(format!("{}\r\n", response).as_bytes())
            .await?;
    }
}

/// Admit a node: recompute the ring, broadcast it, then drive the
/// hand-off from the shrinking successor. The membership lock is held
/// throughout, serializing concurrent joins.
async fn register(membership: &Mutex<Membership>, addr: NodeAddr) -> Response {
    let mut members = membership.lock().await;
    if !members.add(addr.clone()) {
        tracing::warn!("Node {} registered twice", addr);
        return Response::Error("already registered".into());
    }
    tracing::info!("Node joined: {} ({} members)", addr, members.nodes.len());

    let ring = members.ring();
    broadcast_metadata(&members.nodes, &ring).await;

    if members.nodes.len() == 1 {
        // sole member, nothing to hand over
        if let Err(err) = send_control(&addr, &Request::StartServer).await {
            tracing::error!("Failed to release sole node {}: {}", addr, err);
            return Response::Error(err.to_string());
        }
        return Response::Ack;
    }

    let successor = match ring.successor(&addr, 1) {
        Some(range) => range.addr.clone(),
        None => return Response::Error("ring inconsistency".into()),
    };
    let lock_request = Request::SetWriteLock {
        target: Some(addr.clone()),
        shutdown: false,
    };

    // re-drive the hand-off on failure; durability depends on it
    let mut backoff = Backoff::default();
    for attempt in 0..3 {
        match send_control(&successor, &lock_request).await {
            Ok(()) => return Response::Ack,
            Err(err) => {
                tracing::warn!(
                    "Hand-off via {} failed (attempt {}): {}",
                    successor,
                    attempt + 1,
                    err
                );
                backoff.wait().await;
            }
        }
    }
    tracing::error!("Hand-off to admit {} abandoned", addr);
    Response::Error("hand-off failed".into())
}

/// Graceful leave: drop the node, broadcast the shrunk ring and tell the
/// departing node where to drain its data.
async fn deregister(membership: &Mutex<Membership>, addr: &NodeAddr) -> Response {
    let mut members = membership.lock().await;
    if !members.remove(addr) {
        return Response::Error("not registered".into());
    }
    tracing::info!("Node leaving: {} ({} remain)", addr, members.nodes.len());

    if members.nodes.is_empty() {
        return Response::SetWriteLock {
            target: None,
            shutdown: false,
        };
    }

    let ring = members.ring();
    broadcast_metadata(&members.nodes, &ring).await;

    // the node absorbing the departed range takes the drain; the reply
    // context already marks it as final, so the flag stays 0
    let target = ring.owner_of(addr.digest()).map(|range| range.addr.clone());
    Response::SetWriteLock {
        target,
        shutdown: false,
    }
}

/// Remove nodes that failed their liveness probe and propagate the
/// shrunk ring to the survivors.
pub(crate) async fn evict_failed(membership: &Mutex<Membership>, failed: &[NodeAddr]) {
    let mut members = membership.lock().await;
    let mut changed = false;
    for addr in failed {
        if members.remove(addr) {
            tracing::warn!("Node {} failed probe, removed from ring", addr);
            changed = true;
        }
    }
    if !changed {
        return;
    }
    let ring = members.ring();
    if !members.nodes.is_empty() {
        broadcast_metadata(&members.nodes, &ring).await;
    }
}

/// Push a ring snapshot to every member. Individual failures are logged
/// and skipped; an unreachable node will fail its next probe and be
/// removed.
async fn broadcast_metadata(nodes: &[NodeAddr], ring: &RingMetadata) {
    let request = Request::Metadata {
        ranges: ring.encode(),
    };
    for node in nodes {
        if let Err(err) = send_control(node, &request).await {
            tracing::warn!("Metadata push to {} failed: {}", node, err);
        }
    }
}

async fn send_control(node: &NodeAddr, request: &Request) -> Result<()> {
    let mut conn = PeerConnection::open(node).await?;
    match conn.request(request).await? {
        Response::Ack => Ok(()),
        other => Err(Error::Protocol(format!(
            "{} rejected {}: {}",
            node, request, other
        ))),
    }
}
