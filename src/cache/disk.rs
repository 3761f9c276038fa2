//! Tier 2: one file per key plus an `index.json` describing every entry.
//!
//! Entry files are written to a unique temp name and renamed over
//! `<key>.entry`, so a reader maps either the previous file or the new one,
//! never a half-written one. The index lets `cleanup` and budget eviction run
//! from memory without listing the directory.
//!
//! Entry layout (little endian):
//!
//! ```text
//! [0..8]   magic  "LAKEPIPE"
//! [8..16]  format version
//! [16..24] created_at_ms
//! [24..32] ttl_ms
//! [32..40] payload length
//! [40..]   JSON-encoded Batch
//! ```

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::entry::is_expired;
use super::{CacheEntry, CacheKey};
use crate::core::Batch;
use crate::error::CacheError;

const MAGIC: &[u8; 8] = b"LAKEPIPE";
const FORMAT_VERSION: u64 = 1;
const HEADER_LEN: usize = 40;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub file: String,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskIndex {
    entries: HashMap<CacheKey, IndexRecord>,
}

impl DiskIndex {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.size_bytes).sum()
    }

    /// Oldest-created keys to drop so the index fits in `budget`, never
    /// choosing `keep`.
    fn over_budget(&self, budget: u64, keep: &CacheKey) -> Vec<CacheKey> {
        let mut total = self.total_bytes();
        if total <= budget {
            return Vec::new();
        }
        let mut by_age: Vec<(&CacheKey, &IndexRecord)> =
            self.entries.iter().filter(|(k, _)| *k != keep).collect();
        by_age.sort_by_key(|(_, r)| r.created_at_ms);

        let mut victims = Vec::new();
        for (key, record) in by_age {
            if total <= budget {
                break;
            }
            total -= record.size_bytes;
            victims.push(key.clone());
        }
        victims
    }
}

struct DiskInner {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
    /// Serializes index rewrites so the newest snapshot lands last
    index_writer: Mutex<()>,
    /// Held across an index change and the file operation that goes with it,
    /// so a delete never lands on a file a later put renamed into place
    mutation: Mutex<()>,
    tmp_counter: AtomicU64,
}

impl DiskInner {
    fn index(&self) -> MutexGuard<'_, DiskIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocking: drop `key` from the index and delete its file.
    fn remove_key(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let _mutation = self.mutation();
        let Some(record) = self.index().entries.remove(key) else {
            return Ok(false);
        };
        self.remove_file(&record.file)?;
        self.persist_index()?;
        Ok(true)
    }

    fn entry_path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn tmp_path(&self, stem: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{stem}.{}.{n}.tmp", std::process::id()))
    }

    /// Blocking: rewrite `index.json` from the current in-memory index.
    fn persist_index(&self) -> Result<(), CacheError> {
        let _writer = self
            .index_writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let bytes = serde_json::to_vec(&*self.index())?;
        let tmp = self.tmp_path("index");
        write_file(&tmp, &bytes)?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }

    fn remove_file(&self, file: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(file)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct DiskTier {
    inner: Arc<DiskInner>,
}

impl DiskTier {
    /// Open (or create) a tier rooted at `dir`, loading its index.
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        let index = blocking({
            let dir = dir.clone();
            move || load_index(&dir)
        })
        .await?;

        tracing::info!(
            dir = %dir.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes(),
            "Opened disk cache tier"
        );

        Ok(Self {
            inner: Arc::new(DiskInner {
                dir,
                max_bytes,
                index: Mutex::new(index),
                index_writer: Mutex::new(()),
                mutation: Mutex::new(()),
                tmp_counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn len(&self) -> usize {
        self.inner.index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.index().total_bytes()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index().entries.contains_key(key)
    }

    pub fn record(&self, key: &CacheKey) -> Option<IndexRecord> {
        self.inner.index().entries.get(key).cloned()
    }

    /// Read an entry. Expired entries are removed and reported as a miss, as
    /// are index records whose file has gone missing.
    pub async fn get(&self, key: &CacheKey, now_ms: u64) -> Result<Option<CacheEntry>, CacheError> {
        let Some(record) = self.record(key) else {
            return Ok(None);
        };
        if is_expired(record.created_at_ms, record.ttl_ms, now_ms) {
            self.remove_if_current(key, record).await?;
            return Ok(None);
        }

        let owned_key = key.clone();
        let path = self.inner.entry_path(&record.file);
        let read = blocking(move || read_entry(&path, &owned_key)).await;

        match read {
            Ok(None) => {
                if self.remove_if_current(key, record).await? {
                    tracing::warn!(key = %key, "Disk cache entry file missing, dropped from index");
                }
                Ok(None)
            }
            Ok(Some(entry)) if entry.is_expired(now_ms) => {
                self.remove_if_current(key, record).await?;
                Ok(None)
            }
            Ok(entry) => Ok(entry),
            Err(e @ CacheError::Corrupt { .. }) => {
                // a corrupt file will never read back correctly; forget it
                self.remove_if_current(key, record).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Store `entry`, replacing any previous value, then evict oldest-created
    /// entries until the tier fits its budget.
    pub async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(&entry.batch)?;
        let size_bytes = (HEADER_LEN + payload.len()) as u64;
        if size_bytes > self.inner.max_bytes {
            tracing::debug!(
                key = %entry.key,
                size_bytes,
                budget = self.inner.max_bytes,
                "Entry larger than disk budget, not cached"
            );
            // the previous value under this key is now stale
            self.remove(&entry.key).await?;
            return Ok(());
        }

        let inner = self.inner.clone();
        let key = entry.key.clone();
        let created_at_ms = entry.created_at_ms;
        let ttl_ms = entry.ttl_ms;

        let evicted = blocking(move || {
            let file = format!("{}.entry", key.as_str());
            let tmp = inner.tmp_path(key.as_str());
            let mut bytes = Vec::with_capacity(size_bytes as usize);
            bytes.extend_from_slice(MAGIC);
            bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            bytes.extend_from_slice(&created_at_ms.to_le_bytes());
            bytes.extend_from_slice(&ttl_ms.to_le_bytes());
            bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&payload);
            write_file(&tmp, &bytes)?;

            let _mutation = inner.mutation();
            fs::rename(&tmp, inner.entry_path(&file))?;

            let victims = {
                let mut index = inner.index();
                index.entries.insert(
                    key.clone(),
                    IndexRecord {
                        file,
                        size_bytes,
                        created_at_ms,
                        ttl_ms,
                    },
                );
                let victims = index.over_budget(inner.max_bytes, &key);
                victims
                    .into_iter()
                    .filter_map(|k| index.entries.remove(&k).map(|r| (k, r)))
                    .collect::<Vec<_>>()
            };
            for (_, record) in &victims {
                inner.remove_file(&record.file)?;
            }
            inner.persist_index()?;
            Ok(victims.len())
        })
        .await?;

        if evicted > 0 {
            tracing::debug!(evicted, "Evicted oldest disk cache entries over budget");
        }
        Ok(())
    }

    pub async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let inner = self.inner.clone();
        let key = key.clone();
        blocking(move || inner.remove_key(&key)).await
    }

    /// Remove `key` only while the index still holds `record`, so an entry
    /// a concurrent put just stored is left alone.
    async fn remove_if_current(&self, key: &CacheKey, record: IndexRecord) -> Result<bool, CacheError> {
        let inner = self.inner.clone();
        let key = key.clone();
        blocking(move || {
            let _mutation = inner.mutation();
            {
                let mut index = inner.index();
                if index.entries.get(&key) != Some(&record) {
                    return Ok(false);
                }
                index.entries.remove(&key);
            }
            inner.remove_file(&record.file)?;
            inner.persist_index()?;
            Ok(true)
        })
        .await
    }

    pub async fn clear(&self) -> Result<usize, CacheError> {
        let inner = self.inner.clone();
        blocking(move || {
            let _mutation = inner.mutation();
            let records: Vec<IndexRecord> = inner.index().entries.drain().map(|(_, r)| r).collect();
            for record in &records {
                inner.remove_file(&record.file)?;
            }
            inner.persist_index()?;
            Ok(records.len())
        })
        .await
    }

    /// Remove every entry past its TTL, driven by the index alone.
    pub async fn remove_expired(&self, now_ms: u64) -> Result<usize, CacheError> {
        let inner = self.inner.clone();
        blocking(move || {
            let _mutation = inner.mutation();
            let expired: Vec<IndexRecord> = {
                let mut index = inner.index();
                let keys: Vec<CacheKey> = index
                    .entries
                    .iter()
                    .filter(|(_, r)| is_expired(r.created_at_ms, r.ttl_ms, now_ms))
                    .map(|(k, _)| k.clone())
                    .collect();
                keys.iter().filter_map(|k| index.entries.remove(k)).collect()
            };
            if expired.is_empty() {
                return Ok(0);
            }
            for record in &expired {
                inner.remove_file(&record.file)?;
            }
            inner.persist_index()?;
            Ok(expired.len())
        })
        .await
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        let inner = self.inner.clone();
        blocking(move || inner.persist_index()).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Io(std::io::Error::new(ErrorKind::Other, e)))?
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

fn load_index(dir: &Path) -> Result<DiskIndex, CacheError> {
    fs::create_dir_all(dir)?;
    let bytes = match fs::read(dir.join(INDEX_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DiskIndex::default()),
        Err(e) => return Err(e.into()),
    };
    let mut index: DiskIndex = match serde_json::from_slice(&bytes) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cache index unreadable, starting empty");
            return Ok(DiskIndex::default());
        }
    };
    index.entries.retain(|key, record| {
        key.is_well_formed() && record.file == format!("{}.entry", key.as_str())
    });
    Ok(index)
}

fn read_entry(path: &Path, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |reason: &str| CacheError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if (file.metadata()?.len() as usize) < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    // SAFETY: entry files are never modified in place; writers rename a new
    // file over the path, which leaves this mapping on the old inode.
    let mmap = unsafe { Mmap::map(&file)? };

    if &mmap[0..8] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let word = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mmap[at..at + 8]);
        u64::from_le_bytes(buf)
    };
    if word(8) != FORMAT_VERSION {
        return Err(corrupt("unknown format version"));
    }
    let created_at_ms = word(16);
    let ttl_ms = word(24);
    let len = word(32) as usize;
    let end = HEADER_LEN
        .checked_add(len)
        .filter(|end| *end <= mmap.len())
        .ok_or_else(|| corrupt("payload shorter than header says"))?;

    let batch: Batch = serde_json::from_slice(&mmap[HEADER_LEN..end])
        .map_err(|e| corrupt(&format!("payload does not decode: {e}")))?;

    Ok(Some(CacheEntry {
        key: key.clone(),
        size_bytes: end as u64,
        batch,
        created_at_ms,
        ttl_ms,
    }))
}
