//! Client-side request routing
//!
//! Caches the ring snapshot from `keyrange`, hashes keys locally and
//! talks straight to the responsible node: the owner for writes, a
//! uniformly random replica for reads. Transient cluster states
//! (not responsible, write-locked, stopped) are absorbed by an
//! iterative retry loop with jittered backoff and never surface to the
//! caller; structural errors return immediately.

use crate::common::ring::Range;
use crate::common::{
    digest_key, Backoff, Error, NodeAddr, PeerConnection, Request, Response, Result, RingMetadata,
};
use rand::seq::SliceRandom;
use rand::Rng;

/// Keys travel as single protocol tokens, so they are short and
/// space-free.
pub const MAX_KEY_LEN: usize = 20;
/// Values are a single line after escaping.
pub const MAX_VALUE_LEN: usize = 120_000;

const DEFAULT_RETRY_CAP: u32 = 32;

/// Terminal outcome of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
}

pub struct RequestRouter {
    conn: Option<PeerConnection>,
    metadata: Option<RingMetadata>,
    read_ranges: Vec<Range>,
    retry_cap: u32,
    backoff: Backoff,
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRouter {
    pub fn new() -> Self {
        Self {
            conn: None,
            metadata: None,
            read_ranges: Vec::new(),
            retry_cap: DEFAULT_RETRY_CAP,
            backoff: Backoff::default(),
        }
    }

    pub fn with_retry_cap(mut self, cap: u32) -> Self {
        self.retry_cap = cap;
        self
    }

    /// Open a session against any cluster node and pull the ring
    /// snapshot from it (best effort; a stopped node still accepts the
    /// connection and the snapshot arrives on the first retry instead).
    pub async fn connect(&mut self, addr: &NodeAddr) -> Result<()> {
        self.conn = Some(PeerConnection::open(addr).await?);
        if let Err(err) = self.refresh_metadata().await {
            tracing::debug!("Initial ring snapshot unavailable: {}", err);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<PutOutcome> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::ArgumentTooLong(format!(
                "value exceeds {} bytes",
                MAX_VALUE_LEN
            )));
        }
        let hash = digest_key(key);
        let request = Request::Put {
            key: key.to_string(),
            value: value.to_string(),
        };

        self.drive(hash, false, request, |response| match response {
            Response::PutSuccess(_) => Some(Ok(PutOutcome::Created)),
            Response::PutUpdate(_) => Some(Ok(PutOutcome::Updated)),
            Response::PutError(msg) => Some(Err(Error::Internal(msg))),
            _ => None,
        })
        .await
    }

    /// Returns `None` when the key is absent anywhere in its replica set.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let hash = digest_key(key);
        let request = Request::Get {
            key: key.to_string(),
        };

        self.drive(hash, true, request, |response| match response {
            Response::GetSuccess { value, .. } => Some(Ok(Some(value))),
            Response::GetError(_) => Some(Ok(None)),
            _ => None,
        })
        .await
    }

    /// Returns `false` when there was nothing to delete.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let hash = digest_key(key);
        let request = Request::Delete {
            key: key.to_string(),
        };

        self.drive(hash, false, request, |response| match response {
            Response::DeleteSuccess(_) => Some(Ok(true)),
            Response::DeleteError(_) => Some(Ok(false)),
            _ => None,
        })
        .await
    }

    /// Fetch and cache the current ring snapshot.
    pub async fn keyrange(&mut self) -> Result<RingMetadata> {
        self.refresh_metadata().await?;
        self.metadata
            .clone()
            .ok_or_else(|| Error::Protocol("no ring snapshot".into()))
    }

    /// The retry state machine shared by every operation: route, send,
    /// classify. `classify` returns `Some` for terminal outcomes; every
    /// other response is a transient cluster state handled here. The
    /// backoff attempt counter spans operations and resets on any
    /// terminal outcome.
    async fn drive<T>(
        &mut self,
        hash: u128,
        read: bool,
        request: Request,
        classify: impl Fn(Response) -> Option<Result<T>>,
    ) -> Result<T> {
        if self.conn.is_none() {
            return Err(Error::NotConnected);
        }
        let mut last = Error::NotConnected;

        for _ in 0..self.retry_cap {
            if let Err(err) = self.route(hash, read).await {
                last = err;
                self.backoff.wait().await;
                continue;
            }
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => return Err(Error::NotConnected),
            };
            match conn.request(&request).await {
                Ok(response) => match classify(response) {
                    Some(outcome) => {
                        self.backoff.reset();
                        return outcome;
                    }
                    None => {
                        last = self.absorb_transient().await;
                        self.backoff.wait().await;
                    }
                },
                Err(err) if err.is_retryable() || matches!(err, Error::PeerUnreachable(_)) => {
                    // peer went away; pick another node and re-learn the ring
                    self.conn = None;
                    self.failover().await;
                    last = err;
                    self.backoff.wait().await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Handle a non-terminal response: refresh the snapshot so the next
    /// attempt lands on the right node.
    async fn absorb_transient(&mut self) -> Error {
        match self.refresh_metadata().await {
            Ok(()) => Error::NotResponsible,
            Err(err) => err,
        }
    }

    /// Point the connection at the node that should see this request.
    /// Without a snapshot, whatever node we are connected to gets to
    /// tell us otherwise.
    async fn route(&mut self, hash: u128, read: bool) -> Result<()> {
        let target = if read {
            self.pick_replica(hash)
        } else {
            self.metadata
                .as_ref()
                .and_then(|m| m.owner_of(hash))
                .map(|range| range.addr.clone())
        };

        let target = match target {
            Some(target) => target,
            None => return Ok(()),
        };
        if self.conn.as_ref().is_some_and(|c| c.addr() == &target) {
            return Ok(());
        }
        self.conn = Some(PeerConnection::open(&target).await?);
        Ok(())
    }

    /// Uniform choice among the replicas whose read range covers the
    /// hash.
    fn pick_replica(&self, hash: u128) -> Option<NodeAddr> {
        let eligible: Vec<&Range> = self
            .read_ranges
            .iter()
            .filter(|range| range.contains(hash))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..eligible.len());
        Some(eligible[i].addr.clone())
    }

    /// After losing a peer, reconnect to a random other known node so
    /// failing clients spread over the surviving ring instead of piling
    /// onto the first member.
    async fn failover(&mut self) {
        for addr in self.failover_candidates() {
            if let Ok(conn) = PeerConnection::open(&addr).await {
                self.conn = Some(conn);
                let _ = self.refresh_metadata().await;
                return;
            }
        }
    }

    /// Last-known members in uniformly random order.
    fn failover_candidates(&self) -> Vec<NodeAddr> {
        let mut candidates: Vec<NodeAddr> = match &self.metadata {
            Some(metadata) => metadata.ranges().iter().map(|r| r.addr.clone()).collect(),
            None => return Vec::new(),
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    async fn refresh_metadata(&mut self) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(Error::NotConnected)?;

        match conn.request(&Request::Keyrange).await? {
            Response::KeyrangeSuccess(ranges) => {
                self.metadata = Some(RingMetadata::decode(&ranges)?);
            }
            Response::ServerStopped => return Err(Error::Stopped),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected keyrange reply: {}",
                    other
                )))
            }
        }
        match conn.request(&Request::KeyrangeRead).await? {
            Response::KeyrangeReadSuccess(ranges) => {
                self.read_ranges = RingMetadata::decode(&ranges)?.ranges().to_vec();
                Ok(())
            }
            Response::ServerStopped => Err(Error::Stopped),
            other => Err(Error::Protocol(format!(
                "unexpected keyrange_read reply: {}",
                other
            ))),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(' ') {
        return Err(Error::ArgumentTooLong(
            "key must be non-empty and space-free".into(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::ArgumentTooLong(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_a_session() {
        let mut router = RequestRouter::new();
        assert!(matches!(router.put("k", "v").await, Err(Error::NotConnected)));
        assert!(matches!(router.get("k").await, Err(Error::NotConnected)));
        assert!(matches!(router.delete("k").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_oversized_arguments_rejected_locally() {
        let mut router = RequestRouter::new();
        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            router.put(&long_key, "v").await,
            Err(Error::ArgumentTooLong(_))
        ));
        let long_value = "v".repeat(MAX_VALUE_LEN + 1);
        assert!(matches!(
            router.put("k", &long_value).await,
            Err(Error::ArgumentTooLong(_))
        ));
        assert!(matches!(
            router.get("has space").await,
            Err(Error::ArgumentTooLong(_))
        ));
    }

    #[test]
    fn test_failover_candidates_are_shuffled() {
        let nodes: Vec<NodeAddr> = (0..6).map(|i| NodeAddr::new("10.0.0.1", 7000 + i)).collect();
        let mut router = RequestRouter::new();
        router.metadata = Some(RingMetadata::compute(&nodes));

        let baseline = router.failover_candidates();
        assert_eq!(baseline.len(), nodes.len());
        let mut expected = baseline.clone();
        expected.sort();

        let mut reordered = false;
        for _ in 0..64 {
            let draw = router.failover_candidates();
            let mut sorted = draw.clone();
            sorted.sort();
            // always the full member set, order varying between draws
            assert_eq!(sorted, expected);
            if draw != baseline {
                reordered = true;
            }
        }
        assert!(reordered, "candidate order never varied");
    }

    #[test]
    fn test_no_candidates_without_a_snapshot() {
        let router = RequestRouter::new();
        assert!(router.failover_candidates().is_empty());
    }
}
