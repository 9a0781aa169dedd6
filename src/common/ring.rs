//! Consistent-hash ring for ringkv
//!
//! - BLAKE3 digests truncated to 128 bits for key and node placement
//! - Write ranges: one contiguous, circular slice of the hash space per node
//! - Read ranges: a node's write range extended over its predecessors'
//!   ranges, derived once the ring reaches the replication factor
//!
//! A node's upper bound is its own digest; its lower bound is its
//! ring-predecessor's digest plus one, wrapping at the top of the space.
//! Ranges therefore exclude the predecessor's digest and include their own,
//! and both stored bounds are members of the range.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of copies each key has once the ring is large enough.
/// Below this size, replication degrades to node count (each node only
/// holds its own data).
pub const REPLICATION_FACTOR: usize = 3;

/// Address of a storage node, unique within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ring position of this node.
    pub fn digest(&self) -> u128 {
        digest(format!("{}{}", self.host, self.port).as_bytes())
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Protocol(format!("invalid node address: {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid port in address: {}", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Compute the 128-bit placement digest of arbitrary bytes.
///
/// The first 16 bytes of a BLAKE3 hash, interpreted big-endian. Collision
/// resistance is only needed for even distribution, not security.
pub fn digest(data: &[u8]) -> u128 {
    let hash = blake3::hash(data);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_be_bytes(bytes)
}

/// Digest of a user-visible key.
pub fn digest_key(key: &str) -> u128 {
    digest(key.as_bytes())
}

/// Circular range membership, inclusive of both stored bounds.
///
/// A stored lower bound is always the numeric successor of the neighboring
/// digest, so ranges exclude the predecessor's digest and include their own.
/// When `lower > upper` the range wraps past the top of the hash space; a
/// lower bound exactly one above the upper bound denotes the full space.
pub fn in_range(hash: u128, lower: u128, upper: u128) -> bool {
    if lower <= upper {
        lower <= hash && hash <= upper
    } else {
        hash >= lower || hash <= upper
    }
}

/// Wraparound-safe index step on a ring of `len` entries.
fn step_index(i: usize, step: isize, len: usize) -> usize {
    debug_assert!(len > 0);
    (i as isize + step).rem_euclid(len as isize) as usize
}

/// A contiguous, circular slice of the hash space owned or replicated by
/// one node. Immutable once computed; stale ranges are discarded, never
/// updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub addr: NodeAddr,
    pub lower: u128,
    pub upper: u128,
}

impl Range {
    pub fn contains(&self, hash: u128) -> bool {
        in_range(hash, self.lower, self.upper)
    }
}

impl fmt::Display for Range {
    /// Wire form: `lowerHex,upperHex,host:port;`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x},{:032x},{};", self.lower, self.upper, self.addr)
    }
}

impl FromStr for Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_end_matches(';');
        let mut fields = s.splitn(3, ',');
        let lower = fields
            .next()
            .and_then(|f| u128::from_str_radix(f, 16).ok())
            .ok_or_else(|| Error::Protocol(format!("invalid range: {}", s)))?;
        let upper = fields
            .next()
            .and_then(|f| u128::from_str_radix(f, 16).ok())
            .ok_or_else(|| Error::Protocol(format!("invalid range: {}", s)))?;
        let addr = fields
            .next()
            .ok_or_else(|| Error::Protocol(format!("invalid range: {}", s)))?
            .parse()?;
        Ok(Self { addr, lower, upper })
    }
}

/// An ordered snapshot of the ring's write ranges.
///
/// Ranges are sorted by ascending upper bound and circular: the successor of
/// the last entry is the first. A snapshot is regenerated in full on every
/// membership change and replaces the previous one atomically at each node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RingMetadata {
    ranges: Vec<Range>,
}

impl RingMetadata {
    /// Compute write ranges for a set of nodes.
    ///
    /// Nodes are ordered by their digests; each node's upper bound is its own
    /// digest and its lower bound is the numeric successor of its
    /// ring-predecessor's digest. A single node's range wraps around the
    /// whole space.
    pub fn compute(nodes: &[NodeAddr]) -> Self {
        let mut positions: Vec<(u128, NodeAddr)> = nodes
            .iter()
            .map(|addr| (addr.digest(), addr.clone()))
            .collect();
        positions.sort();
        positions.dedup_by(|a, b| a.1 == b.1);

        let len = positions.len();
        let ranges = positions
            .iter()
            .enumerate()
            .map(|(i, (upper, addr))| {
                let (pred_digest, _) = &positions[step_index(i, -1, len)];
                Range {
                    addr: addr.clone(),
                    lower: pred_digest.wrapping_add(1),
                    upper: *upper,
                }
            })
            .collect();

        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Derive the read (replica) ranges from this snapshot.
    ///
    /// For ring size >= REPLICATION_FACTOR each node's read range spans its
    /// own write range plus the write ranges of its FACTOR-1 predecessors.
    /// Below that, read ranges equal write ranges.
    pub fn read_ranges(&self) -> Vec<Range> {
        let len = self.ranges.len();
        if len < REPLICATION_FACTOR {
            return self.ranges.clone();
        }
        let back = -((REPLICATION_FACTOR - 1) as isize);
        self.ranges
            .iter()
            .enumerate()
            .map(|(i, r)| Range {
                addr: r.addr.clone(),
                lower: self.ranges[step_index(i, back, len)].lower,
                upper: r.upper,
            })
            .collect()
    }

    pub fn index_of(&self, addr: &NodeAddr) -> Option<usize> {
        self.ranges.iter().position(|r| &r.addr == addr)
    }

    pub fn range_of(&self, addr: &NodeAddr) -> Option<&Range> {
        self.ranges.iter().find(|r| &r.addr == addr)
    }

    /// The k-th ring-successor of `addr` (k >= 1).
    pub fn successor(&self, addr: &NodeAddr, k: usize) -> Option<&Range> {
        let i = self.index_of(addr)?;
        Some(&self.ranges[step_index(i, k as isize, self.ranges.len())])
    }

    /// The k-th ring-predecessor of `addr` (k >= 1).
    pub fn predecessor(&self, addr: &NodeAddr, k: usize) -> Option<&Range> {
        let i = self.index_of(addr)?;
        Some(&self.ranges[step_index(i, -(k as isize), self.ranges.len())])
    }

    /// The write range a hash falls into.
    pub fn owner_of(&self, hash: u128) -> Option<&Range> {
        self.ranges.iter().find(|r| r.contains(hash))
    }

    /// Serialize as concatenated `lower,upper,host:port;` entries.
    pub fn encode(&self) -> String {
        self.ranges.iter().map(|r| r.to_string()).collect()
    }

    pub fn decode(s: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for entry in s.split(';').filter(|e| !e.is_empty()) {
            ranges.push(entry.parse()?);
        }
        if ranges.is_empty() {
            return Err(Error::Protocol("empty ring metadata".into()));
        }
        Ok(Self { ranges })
    }
}

/// Encode an arbitrary range list the same way as a ring snapshot.
pub fn encode_ranges(ranges: &[Range]) -> String {
    ranges.iter().map(|r| r.to_string()).collect()
}
