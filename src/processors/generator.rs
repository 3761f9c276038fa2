use async_trait::async_trait;
use std::time::Duration;

use crate::core::{Batch, Checkpoint, Column, Source, Split, Table};
use crate::error::SourceError;

/// Infinite feed of synthetic batches, one per `interval`.
///
/// Models live data: splits are never immutable, so the default cache
/// policy never stores them.
pub struct GeneratorSource {
    name: String,
    rows: usize,
    interval: Option<Duration>,
    next_sequence: u64,
}

impl GeneratorSource {
    pub fn new(name: impl Into<String>, rows: usize) -> Self {
        Self {
            name: name.into(),
            rows,
            interval: None,
            next_sequence: 1,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl Source for GeneratorSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        format!("{}:rows={}", self.name, self.rows)
    }

    async fn next_split(&mut self) -> Option<Result<Split, SourceError>> {
        if let Some(interval) = self.interval {
            tokio::time::sleep(interval).await;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Ok(
            Split::new(format!("{}/{}", self.name, sequence), sequence).with_watermark(sequence)
        ))
    }

    async fn fetch(&mut self, split: &Split) -> Result<Batch, SourceError> {
        let base = split.sequence as i64 * self.rows as i64;
        let ids: Vec<i64> = (0..self.rows as i64).map(|i| base + i).collect();
        let table = Table::new().with_column("id", Column::Int64(ids));
        Ok(Batch::for_split(split, table))
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        let sequence = self.next_sequence.checked_sub(1).filter(|s| *s > 0)?;
        Some(Checkpoint {
            source_key: format!("{}/{}", self.name, sequence),
            sequence,
        })
    }

    async fn resume_from(&mut self, checkpoint: &Checkpoint) -> Result<(), SourceError> {
        self.next_sequence = checkpoint.sequence + 1;
        Ok(())
    }
}
