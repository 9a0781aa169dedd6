//! Replication repair simulation
//!
//! Drives the planning functions through join, leave and failure
//! sequences over an in-memory cluster model, mirroring the order of
//! events in the real cluster (snapshot broadcast, plans, write-lock
//! hand-off, bootstrap push). After every step the replica invariant
//! must hold: each key lives on exactly its owner and the owner's
//! successors, nowhere else, with the right value.

use ringkv::common::digest_key;
use ringkv::common::ring::{NodeAddr, RingMetadata, REPLICATION_FACTOR};
use ringkv::node::{plan_bootstrap, plan_transition, select_range};
use std::collections::{BTreeMap, HashMap};

struct SimCluster {
    ring: RingMetadata,
    data: HashMap<NodeAddr, BTreeMap<u128, String>>,
}

impl SimCluster {
    fn new() -> Self {
        Self {
            ring: RingMetadata::default(),
            data: HashMap::new(),
        }
    }

    fn nodes(&self) -> Vec<NodeAddr> {
        self.data.keys().cloned().collect()
    }

    fn entries_of(&self, addr: &NodeAddr) -> Vec<(u128, String)> {
        self.data[addr].iter().map(|(h, v)| (*h, v.clone())).collect()
    }

    /// A client write: primary commit plus synchronous fan-out.
    fn put(&mut self, key: &str, value: &str) {
        let hash = digest_key(key);
        let owner = self.ring.owner_of(hash).unwrap().addr.clone();
        self.data
            .get_mut(&owner)
            .unwrap()
            .insert(hash, value.to_string());
        if self.ring.len() >= REPLICATION_FACTOR {
            for k in 1..REPLICATION_FACTOR {
                let succ = self.ring.successor(&owner, k).unwrap().addr.clone();
                self.data
                    .get_mut(&succ)
                    .unwrap()
                    .insert(hash, value.to_string());
            }
        }
    }

    /// Every member plans against the freshly installed snapshot; all
    /// transfers land, then the prunes.
    fn apply_plans(&mut self, old: &RingMetadata) {
        let plans: Vec<(NodeAddr, _)> = self
            .nodes()
            .into_iter()
            .map(|addr| {
                let entries = self.entries_of(&addr);
                let plan = plan_transition(&addr, old, &self.ring, &entries);
                (addr, plan)
            })
            .collect();

        for (_, plan) in &plans {
            for t in &plan.transfers {
                let target = self.data.get_mut(&t.target).unwrap();
                for (h, v) in &t.entries {
                    target.insert(*h, v.clone());
                }
            }
        }
        for (addr, plan) in &plans {
            let map = self.data.get_mut(addr).unwrap();
            for h in &plan.prune {
                map.remove(h);
            }
        }
    }

    fn join(&mut self, addr: NodeAddr) {
        let old = self.ring.clone();
        self.data.insert(addr.clone(), BTreeMap::new());
        self.ring = RingMetadata::compute(&self.nodes());
        self.apply_plans(&old);

        if self.ring.len() > 1 {
            // write-lock hand-off from the shrinking successor
            let succ = self.ring.successor(&addr, 1).unwrap().addr.clone();
            let succ_range = self.ring.range_of(&succ).unwrap().clone();
            let entries = self.entries_of(&succ);
            let moved = select_range(&entries, succ_range.lower, succ_range.upper, false);

            let target = self.data.get_mut(&addr).unwrap();
            for (h, v) in &moved {
                target.insert(*h, v.clone());
            }
            let read = self.ring.read_ranges();
            let succ_read = read.iter().find(|r| r.addr == succ).unwrap().clone();
            let source = self.data.get_mut(&succ).unwrap();
            for (h, _) in &moved {
                if !succ_read.contains(*h) {
                    source.remove(h);
                }
            }
        }

        // released node seeds its successors with its new write range
        let entries = self.entries_of(&addr);
        let plan = plan_bootstrap(&addr, &self.ring, &entries);
        for t in &plan.transfers {
            let target = self.data.get_mut(&t.target).unwrap();
            for (h, v) in &t.entries {
                target.insert(*h, v.clone());
            }
        }
    }

    /// Graceful leave: drain still-owned keys to the absorbing node,
    /// then the survivors repair.
    fn leave(&mut self, addr: &NodeAddr) {
        let old = self.ring.clone();
        let range = old.range_of(addr).unwrap().clone();
        let entries = self.entries_of(addr);
        let owned = select_range(&entries, range.lower, range.upper, true);

        self.data.remove(addr);
        self.ring = RingMetadata::compute(&self.nodes());

        if let Some(absorber) = self.ring.owner_of(addr.digest()) {
            let absorber = absorber.addr.clone();
            let target = self.data.get_mut(&absorber).unwrap();
            for (h, v) in owned {
                target.insert(h, v);
            }
        }
        self.apply_plans(&old);
    }

    /// Crash: the node's data is gone, survivors repair from replicas.
    fn fail(&mut self, addr: &NodeAddr) {
        let old = self.ring.clone();
        self.data.remove(addr);
        self.ring = RingMetadata::compute(&self.nodes());
        self.apply_plans(&old);
    }

    fn check_invariant(&self, expected: &HashMap<String, String>) {
        let read = self.ring.read_ranges();
        let copies = if self.ring.len() >= REPLICATION_FACTOR {
            REPLICATION_FACTOR
        } else {
            1
        };
        for (key, value) in expected {
            let hash = digest_key(key);
            let holders: Vec<&NodeAddr> = read
                .iter()
                .filter(|r| r.contains(hash))
                .map(|r| &r.addr)
                .collect();
            assert_eq!(
                holders.len(),
                copies,
                "key {} should have {} holders in a {}-ring",
                key,
                copies,
                self.ring.len()
            );
            for (addr, map) in &self.data {
                let has = map.contains_key(&hash);
                let should = holders.contains(&addr);
                assert_eq!(
                    has, should,
                    "key {} at {}: held={}, read range says {}",
                    key, addr, has, should
                );
                if has {
                    assert_eq!(&map[&hash], value, "key {} corrupted at {}", key, addr);
                }
            }
        }
    }
}

fn addr(port: u16) -> NodeAddr {
    NodeAddr::new("10.1.0.1", port)
}

fn seed(sim: &mut SimCluster, expected: &mut HashMap<String, String>, tag: &str, count: usize) {
    for i in 0..count {
        let key = format!("{}-{}", tag, i);
        let value = format!("value-{}-{}", tag, i);
        sim.put(&key, &value);
        expected.insert(key, value);
    }
}

#[test]
fn test_single_node_owns_everything() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();
    sim.join(addr(1));
    seed(&mut sim, &mut expected, "solo", 16);
    sim.check_invariant(&expected);
}

#[test]
fn test_bootstrap_to_factor_triples_every_key() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();
    sim.join(addr(1));
    seed(&mut sim, &mut expected, "one", 16);
    sim.join(addr(2));
    sim.check_invariant(&expected);
    seed(&mut sim, &mut expected, "two", 16);
    sim.join(addr(3));
    sim.check_invariant(&expected);
}

#[test]
fn test_joins_beyond_factor_keep_invariant() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();
    for port in 1..=3 {
        sim.join(addr(port));
    }
    seed(&mut sim, &mut expected, "base", 32);
    for port in 4..=7 {
        sim.join(addr(port));
        sim.check_invariant(&expected);
    }
}

#[test]
fn test_graceful_leave_keeps_invariant() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();
    for port in 1..=5 {
        sim.join(addr(port));
    }
    seed(&mut sim, &mut expected, "leave", 32);

    sim.leave(&addr(3));
    sim.check_invariant(&expected);
    sim.leave(&addr(1));
    sim.check_invariant(&expected);
    // dropping to two nodes abandons replication entirely
    sim.leave(&addr(5));
    sim.check_invariant(&expected);
}

#[test]
fn test_node_failure_loses_no_data() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();
    for port in 1..=5 {
        sim.join(addr(port));
    }
    seed(&mut sim, &mut expected, "crash", 32);

    sim.fail(&addr(2));
    sim.check_invariant(&expected);
    sim.fail(&addr(4));
    sim.check_invariant(&expected);
}

#[test]
fn test_churn_sequence() {
    let mut sim = SimCluster::new();
    let mut expected = HashMap::new();

    sim.join(addr(1));
    seed(&mut sim, &mut expected, "a", 8);
    sim.join(addr(2));
    sim.join(addr(3));
    sim.check_invariant(&expected);

    seed(&mut sim, &mut expected, "b", 8);
    sim.join(addr(4));
    sim.check_invariant(&expected);

    sim.fail(&addr(1));
    sim.check_invariant(&expected);

    sim.join(addr(5));
    seed(&mut sim, &mut expected, "c", 8);
    sim.leave(&addr(2));
    sim.check_invariant(&expected);

    sim.join(addr(6));
    sim.check_invariant(&expected);
}
