//! Replication repair and write fan-out
//!
//! The planner is pure: given the previous and the freshly installed ring
//! snapshot plus this node's durable entries, it derives which entries
//! must be pushed to which successor and which local entries are no
//! longer ours to hold. The rule is entirely local: a node is
//! responsible for keeping copies of its own write range on its
//! `REPLICATION_FACTOR - 1` successors, so on every snapshot install it
//! sends each successor exactly the entries of its write range that the
//! successor's previous read range did not already cover. Applied on
//! every node, this restores full replication after any join, leave or
//! failure without enumerating topology cases.

use crate::common::ring::{NodeAddr, Range, RingMetadata, REPLICATION_FACTOR};
use crate::common::{in_range, Backoff, Error, PeerConnection, Request, Response, Result};

/// A write already committed locally, to be mirrored on the successors.
#[derive(Debug, Clone)]
pub enum ReplicaOp {
    Put { hash: u128, value: String },
    Delete { hash: u128 },
}

/// One outbound repair stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub target: NodeAddr,
    pub entries: Vec<(u128, String)>,
}

/// Everything a node must do after installing a ring snapshot.
///
/// `prune` lists entries that fell out of the node's read range. They
/// are deleted only after every transfer succeeded, so a failed repair
/// never costs the last copy of a key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub transfers: Vec<Transfer>,
    pub prune: Vec<u128>,
}

impl TopologyPlan {
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty() && self.prune.is_empty()
    }
}

/// Filter entries against a circular range, keeping those inside
/// (`include`) or outside (`!include`).
pub fn select_range(
    entries: &[(u128, String)],
    lower: u128,
    upper: u128,
    include: bool,
) -> Vec<(u128, String)> {
    entries
        .iter()
        .filter(|(hash, _)| in_range(*hash, lower, upper) == include)
        .cloned()
        .collect()
}

fn read_range_of<'a>(ranges: &'a [Range], addr: &NodeAddr) -> Option<&'a Range> {
    ranges.iter().find(|r| r.addr == *addr)
}

/// Derive the repair work for one node from an old and a new ring
/// snapshot.
pub fn plan_transition(
    self_addr: &NodeAddr,
    old: &RingMetadata,
    new: &RingMetadata,
    entries: &[(u128, String)],
) -> TopologyPlan {
    let mut plan = TopologyPlan::default();

    // Not part of the new ring: departure hand-off moves our data.
    let my_range = match new.range_of(self_addr) {
        Some(range) => range,
        None => return plan,
    };

    // Entries outside the new read range are pruned, but only when the
    // old ring already replicated them on some other node. A sole
    // copy stays put until the hand-off moves it, which prunes on its
    // own after a successful transfer.
    let new_read = new.read_ranges();
    let old_read = old.read_ranges();
    if let Some(read) = read_range_of(&new_read, self_addr) {
        plan.prune = entries
            .iter()
            .filter(|(hash, _)| !read.contains(*hash))
            .filter(|(hash, _)| {
                old_read
                    .iter()
                    .any(|r| r.addr != *self_addr && r.contains(*hash))
            })
            .map(|(hash, _)| *hash)
            .collect();
    }

    if new.len() < REPLICATION_FACTOR {
        return plan;
    }

    for k in 1..REPLICATION_FACTOR {
        let succ = match new.successor(self_addr, k) {
            Some(range) => range,
            None => break,
        };
        if succ.addr == *self_addr {
            break;
        }
        let prior = read_range_of(&old_read, &succ.addr);
        let missing: Vec<(u128, String)> = entries
            .iter()
            .filter(|(hash, _)| my_range.contains(*hash))
            .filter(|(hash, _)| prior.map_or(true, |r| !r.contains(*hash)))
            .cloned()
            .collect();
        if !missing.is_empty() {
            plan.transfers.push(Transfer {
                target: succ.addr.clone(),
                entries: missing,
            });
        }
    }

    plan
}

/// Repair work for a node that was just released for traffic: push its
/// write range to every successor. The hand-off only provisions the
/// node itself, so its successors may still lack copies of the range it
/// now owns (the second successor always does when the ring just
/// reached the replication factor). Receivers overwrite in place, so
/// duplicates are harmless.
pub fn plan_bootstrap(
    self_addr: &NodeAddr,
    ring: &RingMetadata,
    entries: &[(u128, String)],
) -> TopologyPlan {
    let mut plan = TopologyPlan::default();
    if ring.len() < REPLICATION_FACTOR {
        return plan;
    }
    let my_range = match ring.range_of(self_addr) {
        Some(range) => range,
        None => return plan,
    };
    let owned: Vec<(u128, String)> = entries
        .iter()
        .filter(|(hash, _)| my_range.contains(*hash))
        .cloned()
        .collect();
    if owned.is_empty() {
        return plan;
    }
    for k in 1..REPLICATION_FACTOR {
        if let Some(succ) = ring.successor(self_addr, k) {
            if succ.addr == *self_addr {
                break;
            }
            plan.transfers.push(Transfer {
                target: succ.addr.clone(),
                entries: owned.clone(),
            });
        }
    }
    plan
}

/// Drives transfers and fan-out over the wire with bounded retries.
pub struct ReplicationManager {
    retry_cap: u32,
}

impl ReplicationManager {
    pub fn new(retry_cap: u32) -> Self {
        Self { retry_cap }
    }

    /// Stream entries to a peer over the hashed-key write path. One
    /// connection per attempt; the whole stream is retried on failure.
    pub async fn send_entries(
        &self,
        target: &NodeAddr,
        entries: &[(u128, String)],
    ) -> Result<()> {
        let mut backoff = Backoff::default();
        let mut attempt = 0;
        loop {
            match self.try_send(target, entries).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retry_cap => {
                    attempt += 1;
                    tracing::debug!(
                        "Transfer to {} failed (attempt {}): {}, retrying",
                        target,
                        attempt,
                        err
                    );
                    backoff.wait().await;
                }
                Err(err) => {
                    return Err(Error::Transfer {
                        target: target.to_string(),
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    async fn try_send(&self, target: &NodeAddr, entries: &[(u128, String)]) -> Result<()> {
        let mut conn = PeerConnection::open(target).await?;
        for (hash, value) in entries {
            let req = Request::PutHash {
                key: *hash,
                value: value.clone(),
            };
            match conn.request(&req).await? {
                Response::PutSuccess(_) | Response::PutUpdate(_) => {}
                Response::ServerWriteLock => return Err(Error::WriteLocked),
                other => {
                    return Err(Error::Protocol(format!(
                        "peer {} rejected transfer: {}",
                        target, other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Mirror a committed write onto the successor nodes, off the client's
    /// critical path. Each target retries independently with backoff up
    /// to the configured cap.
    pub fn spawn_fan_out(&self, op: ReplicaOp, targets: Vec<NodeAddr>) {
        for target in targets {
            let op = op.clone();
            let retry_cap = self.retry_cap;
            tokio::spawn(async move {
                if let Err(err) = forward_op(&target, &op, retry_cap).await {
                    tracing::warn!("Replica fan-out to {} gave up: {}", target, err);
                }
            });
        }
    }
}

async fn forward_op(target: &NodeAddr, op: &ReplicaOp, retry_cap: u32) -> Result<()> {
    let req = match op {
        ReplicaOp::Put { hash, value } => Request::PutHash {
            key: *hash,
            value: value.clone(),
        },
        ReplicaOp::Delete { hash } => Request::DeleteHash { key: *hash },
    };

    let mut backoff = Backoff::default();
    let mut attempt = 0;
    loop {
        let outcome = async {
            let mut conn = PeerConnection::open(target).await?;
            conn.request(&req).await
        }
        .await;

        match outcome {
            Ok(Response::PutSuccess(_))
            | Ok(Response::PutUpdate(_))
            | Ok(Response::DeleteSuccess(_)) => return Ok(()),
            // deleting a replica copy that never arrived is a no-op
            Ok(Response::DeleteError(_)) => return Ok(()),
            Ok(Response::ServerWriteLock) | Ok(Response::ServerStopped) | Err(_)
                if attempt < retry_cap =>
            {
                attempt += 1;
                backoff.wait().await;
            }
            Ok(other) => {
                return Err(Error::Protocol(format!(
                    "replica {} rejected forward: {}",
                    target, other
                )))
            }
            Err(err) => return Err(err),
        }
    }
}
