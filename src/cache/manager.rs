use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{CacheEntry, CacheKey, CachePolicy, Clock, DiskTier, MemoryTier, SystemClock};
use crate::config::CacheConfig;
use crate::core::{Batch, Split};
use crate::error::CacheError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Two-tier cache shared by every executor in the process.
///
/// Constructed once and handed to executors as an `Arc`. No operation
/// returns an error: tier-2 failures are logged, counted in
/// [`CacheStats::errors`] and reported as a miss.
pub struct CacheManager {
    memory: MemoryTier,
    disk: Option<DiskTier>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    policy: CachePolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("disk_enabled", &self.disk.is_some())
            .field("default_ttl", &self.default_ttl)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build from config after validating it. A `dir` enables the disk tier.
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        // only a disabled cache may carry a zero capacity
        let capacity = NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        let disk = match &config.dir {
            Some(dir) if config.enabled => Some(DiskTier::open(dir, config.max_disk_size).await?),
            _ => None,
        };
        let mut manager = Self::new(capacity, disk, config.ttl());
        manager.policy = CachePolicy::from_config(config)?;
        Ok(manager)
    }

    /// Memory-only cache with the default policy.
    pub fn in_memory(capacity: NonZeroUsize, default_ttl: Duration) -> Self {
        Self::new(capacity, None, default_ttl)
    }

    pub fn with_disk(capacity: NonZeroUsize, disk: DiskTier, default_ttl: Duration) -> Self {
        Self::new(capacity, Some(disk), default_ttl)
    }

    fn new(capacity: NonZeroUsize, disk: Option<DiskTier>, default_ttl: Duration) -> Self {
        Self {
            memory: MemoryTier::new(capacity),
            disk,
            clock: Arc::new(SystemClock),
            default_ttl,
            policy: CachePolicy::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn should_cache(&self, split: &Split) -> bool {
        self.policy.should_cache(split)
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> Option<&DiskTier> {
        self.disk.as_ref()
    }

    fn absorb(&self, op: &'static str, key: Option<&CacheKey>, error: CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        match key {
            Some(key) => tracing::warn!(op, key = %key, error = %error, "Cache error treated as miss"),
            None => tracing::warn!(op, error = %error, "Cache error ignored"),
        }
    }

    fn miss(&self) -> Option<Batch> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn hit(&self, batch: Batch) -> Option<Batch> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(batch)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Batch> {
        let now = self.clock.now_millis();

        if let Some(entry) = self.memory.get(key) {
            if !entry.is_expired(now) {
                return self.hit(entry.batch.clone());
            }
            // the disk copy shares the same creation time
            self.invalidate(key).await;
            return self.miss();
        }

        let Some(disk) = &self.disk else {
            return self.miss();
        };
        match disk.get(key, now).await {
            Ok(Some(entry)) => {
                let batch = entry.batch.clone();
                self.memory.insert(Arc::new(entry));
                tracing::debug!(key = %key, "Promoted disk cache hit");
                self.hit(batch)
            }
            Ok(None) => self.miss(),
            Err(e) => {
                self.absorb("get", Some(key), e);
                self.miss()
            }
        }
    }

    /// Store under `key`, replacing any previous entry in both tiers.
    pub async fn put(&self, key: &CacheKey, batch: &Batch, ttl: Duration) {
        let entry = CacheEntry::new(key.clone(), batch.clone(), self.clock.now_millis(), ttl);

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.put(&entry).await {
                self.absorb("put", Some(key), e);
            }
        }
        if let Some(evicted) = self.memory.insert(Arc::new(entry)) {
            tracing::trace!(evicted = %evicted, "Memory tier evicted least recently used");
        }
    }

    pub async fn put_default(&self, key: &CacheKey, batch: &Batch) {
        self.put(key, batch, self.default_ttl).await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let mut removed = self.memory.remove(key);
        if let Some(disk) = &self.disk {
            match disk.remove(key).await {
                Ok(on_disk) => removed |= on_disk,
                Err(e) => self.absorb("invalidate", Some(key), e),
            }
        }
        removed
    }

    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear().await {
                self.absorb("clear", None, e);
            }
        }
        tracing::info!("Cache cleared");
    }

    /// Drop every entry past its TTL from both tiers.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = self.memory.remove_expired(now);
        if let Some(disk) = &self.disk {
            match disk.remove_expired(now).await {
                Ok(n) => removed += n,
                Err(e) => self.absorb("cleanup", None, e),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed expired cache entries");
        }
        removed
    }

    /// Persist the disk index. The manager stays usable afterwards.
    pub async fn close(&self) {
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.flush().await {
                self.absorb("close", None, e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            disk_entries: self.disk.as_ref().map_or(0, DiskTier::len),
            disk_bytes: self.disk.as_ref().map_or(0, DiskTier::total_bytes),
        }
    }
}
