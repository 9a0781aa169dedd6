//! Bounded in-memory cache over the durable store
//!
//! Write-back: a put lands in the cache and is marked dirty; the durable
//! store is written when the entry is evicted or on an explicit flush.
//! Reads consult the store only on a cache miss and promote the value.
//! Eviction strategy is pluggable; the policy only tracks key digests,
//! the cached values live in the layer itself.

use crate::common::config::EvictionStrategy;
use crate::common::Result;
use crate::node::store::DurableStore;
use std::collections::{HashMap, HashSet, VecDeque};

/// Eviction bookkeeping, fed by the cache layer on every access.
///
/// `select_victim` must also forget the returned key, so the layer can
/// evict in a loop without re-notifying the policy.
pub trait EvictionPolicy: Send {
    /// A key was inserted or overwritten.
    fn on_put(&mut self, hash: u128);
    /// A cached key was read.
    fn on_get(&mut self, hash: u128);
    /// A key left the cache for a reason other than eviction.
    fn on_delete(&mut self, hash: u128);
    /// Pick the next key to evict and drop it from the bookkeeping.
    fn select_victim(&mut self) -> Option<u128>;
}

/// First-in-first-out: insertion order, untouched by reads or updates.
#[derive(Default)]
pub struct FifoPolicy {
    queue: VecDeque<u128>,
}

impl EvictionPolicy for FifoPolicy {
    fn on_put(&mut self, hash: u128) {
        if !self.queue.contains(&hash) {
            self.queue.push_back(hash);
        }
    }

    fn on_get(&mut self, _hash: u128) {}

    fn on_delete(&mut self, hash: u128) {
        self.queue.retain(|h| *h != hash);
    }

    fn select_victim(&mut self) -> Option<u128> {
        self.queue.pop_front()
    }
}

/// Least-recently-used: any read or write moves the key to the back.
#[derive(Default)]
pub struct LruPolicy {
    queue: VecDeque<u128>,
}

impl LruPolicy {
    fn touch(&mut self, hash: u128) {
        self.queue.retain(|h| *h != hash);
        self.queue.push_back(hash);
    }
}

impl EvictionPolicy for LruPolicy {
    fn on_put(&mut self, hash: u128) {
        self.touch(hash);
    }

    fn on_get(&mut self, hash: u128) {
        self.touch(hash);
    }

    fn on_delete(&mut self, hash: u128) {
        self.queue.retain(|h| *h != hash);
    }

    fn select_victim(&mut self) -> Option<u128> {
        self.queue.pop_front()
    }
}

/// Least-frequently-used, with insertion order breaking frequency ties
/// so a freshly admitted key cannot starve an older equally-cold one.
#[derive(Default)]
pub struct LfuPolicy {
    counts: HashMap<u128, (u64, u64)>,
    tick: u64,
}

impl EvictionPolicy for LfuPolicy {
    fn on_put(&mut self, hash: u128) {
        self.tick += 1;
        let tick = self.tick;
        self.counts
            .entry(hash)
            .and_modify(|(count, _)| *count += 1)
            .or_insert((1, tick));
    }

    fn on_get(&mut self, hash: u128) {
        if let Some((count, _)) = self.counts.get_mut(&hash) {
            *count += 1;
        }
    }

    fn on_delete(&mut self, hash: u128) {
        self.counts.remove(&hash);
    }

    fn select_victim(&mut self) -> Option<u128> {
        let victim = self
            .counts
            .iter()
            .min_by_key(|(_, (count, tick))| (*count, *tick))
            .map(|(hash, _)| *hash)?;
        self.counts.remove(&victim);
        Some(victim)
    }
}

fn make_policy(strategy: EvictionStrategy) -> Box<dyn EvictionPolicy> {
    match strategy {
        EvictionStrategy::Fifo => Box::<FifoPolicy>::default(),
        EvictionStrategy::Lru => Box::<LruPolicy>::default(),
        EvictionStrategy::Lfu => Box::<LfuPolicy>::default(),
    }
}

/// The node's data path: bounded cache in front of the durable store.
pub struct CacheLayer {
    store: Box<dyn DurableStore>,
    cache: HashMap<u128, String>,
    dirty: HashSet<u128>,
    capacity: usize,
    policy: Box<dyn EvictionPolicy>,
}

impl CacheLayer {
    pub fn new(store: Box<dyn DurableStore>, capacity: usize, strategy: EvictionStrategy) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            capacity,
            policy: make_policy(strategy),
        }
    }

    /// Make room for one more entry. An evicted dirty entry is written
    /// back before it leaves the cache.
    fn make_room(&mut self, incoming: u128) -> Result<()> {
        while self.cache.len() >= self.capacity && !self.cache.contains_key(&incoming) {
            let victim = match self.policy.select_victim() {
                Some(victim) => victim,
                None => break,
            };
            if let Some(value) = self.cache.remove(&victim) {
                if self.dirty.remove(&victim) {
                    self.store.put(victim, value)?;
                }
            }
        }
        Ok(())
    }

    /// Insert or overwrite. Returns `true` when the key already existed.
    pub fn put(&mut self, hash: u128, value: String) -> Result<bool> {
        let existed = self.cache.contains_key(&hash) || self.store.contains(hash);
        self.make_room(hash)?;
        self.cache.insert(hash, value);
        self.dirty.insert(hash);
        self.policy.on_put(hash);
        Ok(existed)
    }

    /// Look up a value, promoting store hits into the cache.
    pub fn get(&mut self, hash: u128) -> Result<Option<String>> {
        if let Some(value) = self.cache.get(&hash) {
            let value = value.clone();
            self.policy.on_get(hash);
            return Ok(Some(value));
        }
        let value = match self.store.get(hash) {
            Some(value) => value,
            None => return Ok(None),
        };
        self.make_room(hash)?;
        self.cache.insert(hash, value.clone());
        self.policy.on_put(hash);
        Ok(Some(value))
    }

    /// Remove a key everywhere. Returns `true` when it was present.
    pub fn delete(&mut self, hash: u128) -> Result<bool> {
        let cached = self.cache.remove(&hash).is_some();
        self.dirty.remove(&hash);
        if cached {
            self.policy.on_delete(hash);
        }
        let stored = self.store.delete(hash)?;
        Ok(cached || stored)
    }

    /// Write every dirty entry back to the durable store, then drop all
    /// cache residents and eviction bookkeeping. Idempotent; flushing an
    /// empty cache is a no-op.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u128> = self.dirty.iter().copied().collect();
        for hash in dirty {
            if let Some(value) = self.cache.get(&hash) {
                self.store.put(hash, value.clone())?;
            }
            self.dirty.remove(&hash);
        }
        self.cache.clear();
        while self.policy.select_victim().is_some() {}
        Ok(())
    }

    /// Flush, then return every durable entry ordered by digest. Used by
    /// replication transfers and hand-off range scans.
    pub fn entries(&mut self) -> Result<Vec<(u128, String)>> {
        self.flush()?;
        Ok(self.store.entries())
    }

    pub fn len(&self) -> usize {
        let cache_only = self
            .cache
            .keys()
            .filter(|h| !self.store.contains(**h))
            .count();
        self.store.len() + cache_only
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.store.is_empty()
    }

    #[cfg(test)]
    fn cached(&self, hash: u128) -> bool {
        self.cache.contains_key(&hash)
    }

    #[cfg(test)]
    fn stored(&self, hash: u128) -> bool {
        self.store.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::store::MemStore;

    fn layer(capacity: usize, strategy: EvictionStrategy) -> CacheLayer {
        CacheLayer::new(Box::new(MemStore::new()), capacity, strategy)
    }

    #[test]
    fn test_fifo_evicts_oldest_insert() {
        let mut cache = layer(2, EvictionStrategy::Fifo);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        // reading 1 must not protect it under FIFO
        cache.get(1).unwrap();
        cache.put(3, "c".into()).unwrap();

        assert!(!cache.cached(1));
        assert!(cache.cached(2));
        assert!(cache.cached(3));
    }

    #[test]
    fn test_lru_read_protects_entry() {
        let mut cache = layer(2, EvictionStrategy::Lru);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        cache.get(1).unwrap();
        cache.put(3, "c".into()).unwrap();

        assert!(cache.cached(1));
        assert!(!cache.cached(2));
        assert!(cache.cached(3));
    }

    #[test]
    fn test_lfu_evicts_coldest() {
        let mut cache = layer(2, EvictionStrategy::Lfu);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        cache.get(1).unwrap();
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        cache.put(3, "c".into()).unwrap();

        // counts at eviction time: 1 -> 3, 2 -> 2, so 2 is the victim
        assert!(cache.cached(1));
        assert!(!cache.cached(2));
        assert!(cache.cached(3));
    }

    #[test]
    fn test_writes_stay_in_cache_until_eviction() {
        let mut cache = layer(2, EvictionStrategy::Fifo);
        cache.put(1, "a".into()).unwrap();
        assert!(!cache.stored(1));

        cache.put(2, "b".into()).unwrap();
        cache.put(3, "c".into()).unwrap();
        // evicting 1 wrote it back
        assert!(!cache.cached(1));
        assert!(cache.stored(1));
        assert_eq!(cache.get(1).unwrap(), Some("a".into()));
    }

    #[test]
    fn test_flush_persists_and_empties_the_cache() {
        let mut cache = layer(4, EvictionStrategy::Lru);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        assert!(!cache.stored(1));

        cache.flush().unwrap();
        assert!(cache.stored(1));
        assert!(cache.stored(2));
        assert!(!cache.cached(1));
        assert!(!cache.cached(2));
        // values come back through the store on the next read
        assert_eq!(cache.get(1).unwrap(), Some("a".into()));
        // flushing again with nothing pending changes nothing
        cache.flush().unwrap();
        assert_eq!(cache.get(2).unwrap(), Some("b".into()));
    }

    #[test]
    fn test_flush_resets_eviction_bookkeeping() {
        let mut cache = layer(2, EvictionStrategy::Fifo);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        cache.flush().unwrap();

        // pre-flush insertion order must not leak into the next round:
        // with 3 and 4 admitted fresh, 3 is the oldest and the victim
        cache.put(3, "c".into()).unwrap();
        cache.put(4, "d".into()).unwrap();
        cache.put(5, "e".into()).unwrap();
        assert!(!cache.cached(3));
        assert!(cache.cached(4));
        assert!(cache.cached(5));
    }

    #[test]
    fn test_fifo_update_keeps_insertion_order() {
        let mut cache = layer(2, EvictionStrategy::Fifo);
        cache.put(1, "a".into()).unwrap();
        cache.put(2, "b".into()).unwrap();
        // overwriting 1 must not move it off the front of the queue
        cache.put(1, "a2".into()).unwrap();
        cache.put(3, "c".into()).unwrap();

        assert!(!cache.cached(1));
        assert!(cache.cached(2));
        assert!(cache.cached(3));
        // the evicted update was written back, not lost
        assert_eq!(cache.get(1).unwrap(), Some("a2".into()));
    }

    #[test]
    fn test_update_reports_existing_key() {
        let mut cache = layer(4, EvictionStrategy::Lru);
        assert!(!cache.put(1, "a".into()).unwrap());
        assert!(cache.put(1, "a2".into()).unwrap());
        assert_eq!(cache.get(1).unwrap(), Some("a2".into()));
    }

    #[test]
    fn test_delete_clears_cache_and_store() {
        let mut cache = layer(4, EvictionStrategy::Lfu);
        cache.put(1, "a".into()).unwrap();
        cache.flush().unwrap();
        assert!(cache.delete(1).unwrap());
        assert!(!cache.delete(1).unwrap());
        assert_eq!(cache.get(1).unwrap(), None);
    }

    #[test]
    fn test_delete_of_unflushed_entry_reports_present() {
        let mut cache = layer(4, EvictionStrategy::Fifo);
        cache.put(1, "a".into()).unwrap();
        assert!(cache.delete(1).unwrap());
        assert_eq!(cache.get(1).unwrap(), None);
    }

    #[test]
    fn test_entries_includes_unflushed_writes() {
        let mut cache = layer(4, EvictionStrategy::Fifo);
        cache.put(2, "b".into()).unwrap();
        cache.put(1, "a".into()).unwrap();
        let entries = cache.entries().unwrap();
        assert_eq!(entries, vec![(1, "a".into()), (2, "b".into())]);
    }
}
