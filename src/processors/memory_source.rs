use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{Batch, Checkpoint, Source, Split, Table};
use crate::error::SourceError;

/// Bounded source over tables held in memory, one split per table.
///
/// Sequences start at 1 and follow insertion order.
pub struct MemorySource {
    name: String,
    partitions: Vec<(String, Table)>,
    next: usize,
    immutable: bool,
    cacheable: bool,
    delay: Option<Duration>,
    last: Option<Checkpoint>,
    fetches: Arc<AtomicU64>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: Vec::new(),
            next: 0,
            immutable: false,
            cacheable: false,
            delay: None,
            last: None,
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Keys default to `<name>/<sequence>`.
    pub fn from_tables(name: impl Into<String>, tables: impl IntoIterator<Item = Table>) -> Self {
        let mut source = Self::new(name);
        for table in tables {
            let key = format!("{}/{}", source.name, source.partitions.len() + 1);
            source.partitions.push((key, table));
        }
        source
    }

    pub fn with_partition(mut self, source_key: impl Into<String>, table: Table) -> Self {
        self.partitions.push((source_key.into(), table));
        self
    }

    /// Mark every split as historical, immutable input.
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Simulated fetch latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of completed fetches; survives moving the source into
    /// a pipeline.
    pub fn fetch_counter(&self) -> Arc<AtomicU64> {
        self.fetches.clone()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_split(&mut self) -> Option<Result<Split, SourceError>> {
        let (key, _) = self.partitions.get(self.next)?;
        self.next += 1;

        let mut split = Split::new(key.clone(), self.next as u64);
        split.immutable = self.immutable;
        split.cacheable = self.cacheable;
        self.last = Some(split.checkpoint());
        Some(Ok(split))
    }

    async fn fetch(&mut self, split: &Split) -> Result<Batch, SourceError> {
        let index = split
            .sequence
            .checked_sub(1)
            .ok_or_else(|| SourceError::Fetch(format!("no partition for sequence {}", split.sequence)))?;
        let (_, table) = self
            .partitions
            .get(index as usize)
            .ok_or_else(|| SourceError::Fetch(format!("no partition for sequence {}", split.sequence)))?;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(Batch::for_split(split, table.clone()))
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.last.clone()
    }

    async fn resume_from(&mut self, checkpoint: &Checkpoint) -> Result<(), SourceError> {
        let position = checkpoint.sequence as usize;
        match position.checked_sub(1).and_then(|i| self.partitions.get(i)) {
            Some((key, _)) if *key == checkpoint.source_key => {
                self.next = position;
                self.last = Some(checkpoint.clone());
                Ok(())
            }
            _ if position == 0 => {
                self.next = 0;
                self.last = None;
                Ok(())
            }
            _ => Err(SourceError::Unsupported(format!(
                "checkpoint {}@{} does not belong to source `{}`",
                checkpoint.source_key, checkpoint.sequence, self.name
            ))),
        }
    }
}
