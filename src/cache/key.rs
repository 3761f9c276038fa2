use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Content address of a cached batch: SHA-256 over the source key and the
/// fingerprint of the pipeline that reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(source_key: &str, fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_key.as_bytes());
        // separator so ("ab", "c") and ("a", "bc") differ
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys loaded from disk are only trusted if they look derived.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub(crate) fn shard(&self, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() % shards as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
