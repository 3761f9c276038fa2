use super::CacheKey;
use crate::core::Batch;
use std::time::Duration;

/// Immutable cached value. Updating a key replaces the whole entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub batch: Batch,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, batch: Batch, created_at_ms: u64, ttl: Duration) -> Self {
        let size_bytes = batch.size_bytes() as u64;
        Self {
            key,
            batch,
            created_at_ms,
            ttl_ms: ttl.as_millis() as u64,
            size_bytes,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        is_expired(self.created_at_ms, self.ttl_ms, now_ms)
    }
}

pub(crate) fn is_expired(created_at_ms: u64, ttl_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(created_at_ms) > ttl_ms
}
