use crate::core::{Ack, Batch, Sink};
use crate::error::SinkError;
use crate::observability::StageMetrics;
use super::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sink wrapper that adds per-call timeouts, bounded retries and metrics.
///
/// A retried write re-sends the same batch; the inner sink only ever sees
/// one successful write per batch.
pub struct ResilientSink {
    inner: Arc<dyn Sink>,
    metrics: Arc<StageMetrics>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl ResilientSink {
    pub fn new(
        inner: Arc<dyn Sink>,
        metrics: Arc<StageMetrics>,
        retry: RetryPolicy,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            metrics,
            retry,
            timeout,
        }
    }

    async fn write_once(&self, batch: &Batch) -> Result<Ack, SinkError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.write(batch))
                .await
                .unwrap_or(Err(SinkError::Timeout(limit))),
            None => self.inner.write(batch).await,
        }
    }
}

#[async_trait]
impl Sink for ResilientSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn write(&self, batch: &Batch) -> Result<Ack, SinkError> {
        let start = self.metrics.start_timer();
        let mut attempt = 1;

        loop {
            match self.write_once(batch).await {
                Ok(ack) => {
                    self.metrics.observe_latency(start);
                    self.metrics.record_processed(batch.size_bytes());
                    return Ok(ack);
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        sink = self.inner.name(),
                        sequence = batch.sequence(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_error();
                    return Err(e);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}
