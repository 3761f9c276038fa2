use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::{Ack, Batch, Sink};
use crate::error::SinkError;

#[derive(Default)]
struct Collected {
    batches: Mutex<Vec<Batch>>,
    attempts: AtomicU64,
}

/// Sink that keeps every accepted batch in memory.
///
/// Clones share storage, so a test can keep one handle and hand the other
/// to a pipeline.
#[derive(Clone)]
pub struct CollectSink {
    name: String,
    collected: Arc<Collected>,
    delay: Option<Duration>,
    failures_left: Arc<AtomicU32>,
}

impl CollectSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collected: Arc::new(Collected::default()),
            delay: None,
            failures_left: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Simulated write latency, applied to every attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` write attempts with a transient error.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.collected
            .batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.batches().iter().map(Batch::sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.collected
            .batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every write call, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.collected.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for CollectSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, batch: &Batch) -> Result<Ack, SinkError> {
        self.collected.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SinkError::Write(format!(
                "transient failure writing batch {}",
                batch.sequence()
            )));
        }

        self.collected
            .batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(batch.clone());
        Ok(Ack::for_batch(batch))
    }
}
