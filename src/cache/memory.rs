use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CacheEntry, CacheKey};

const MAX_SHARDS: usize = 16;

type Shard = Mutex<LruCache<CacheKey, Arc<CacheEntry>>>;

/// Tier 1: bounded LRU split into independently locked shards.
///
/// Locks are plain `std::sync::Mutex` and are never held across an await.
/// There are never more shards than slots, so a capacity of 1 is a single
/// one-slot LRU.
pub struct MemoryTier {
    shards: Vec<Shard>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        let shard_count = capacity.min(MAX_SHARDS);
        let base = capacity / shard_count;
        let extra = capacity % shard_count;

        let shards = (0..shard_count)
            .map(|i| {
                let slots = base + usize::from(i < extra);
                // shard_count <= capacity, so every shard gets at least one slot
                let slots = NonZeroUsize::new(slots).unwrap_or(NonZeroUsize::MIN);
                Mutex::new(LruCache::new(slots))
            })
            .collect();

        Self { shards, capacity }
    }

    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, LruCache<CacheKey, Arc<CacheEntry>>> {
        self.shards[key.shard(self.shards.len())]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lookup that refreshes recency.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.shard(key).get(key).cloned()
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shard(key).contains(key)
    }

    /// Insert or replace. Returns the key pushed out to make room, if any.
    pub fn insert(&self, entry: Arc<CacheEntry>) -> Option<CacheKey> {
        let key = entry.key.clone();
        match self.shard(&key).push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.shard(key).pop(key).is_some()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
    }

    /// Drop every entry older than its TTL. Returns how many were removed.
    pub fn remove_expired(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let expired: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now_ms))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                shard.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
