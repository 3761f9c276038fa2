use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::{RunMetrics, StageMetrics};
use crate::resilience::policy::error_rate;

#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub stage_id: String,
    pub processed: u64,
    pub errors: u64,
    pub retries: u64,
    pub bytes: u64,
    pub avg_latency_us: u64,
}

/// Point-in-time view of a run, carried by both sides of the pipeline result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Batches acknowledged by the sink
    pub processed: u64,
    pub batches_read: u64,
    pub dropped: u64,
    pub errors: u64,
    pub retries: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub peak_in_flight: u64,
    pub duration: Duration,
    /// Acked batches per second
    pub throughput: f64,
    pub error_rate: f64,
    pub stages: BTreeMap<String, StageSnapshot>,
}

/// Registry of stage metrics for one run, injected into the executor.
///
/// Clones share the same counters, so a caller can keep a handle and watch
/// a run while it executes.
#[derive(Clone)]
pub struct MetricsCollector {
    stages: Arc<RwLock<BTreeMap<String, Arc<StageMetrics>>>>,
    run: Arc<RunMetrics>,
    started: Arc<RwLock<Option<Instant>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            stages: Arc::new(RwLock::new(BTreeMap::new())),
            run: Arc::new(RunMetrics::new()),
            started: Arc::new(RwLock::new(None)),
        }
    }

    /// Register (or fetch the already registered) metrics for a stage.
    pub fn register(&self, stage_id: impl Into<String>) -> Arc<StageMetrics> {
        let stage_id = stage_id.into();
        let mut stages = self
            .stages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stages
            .entry(stage_id.clone())
            .or_insert_with(|| Arc::new(StageMetrics::new(stage_id)))
            .clone()
    }

    pub fn stage(&self, stage_id: &str) -> Option<Arc<StageMetrics>> {
        self.stages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(stage_id)
            .cloned()
    }

    pub fn run(&self) -> &Arc<RunMetrics> {
        &self.run
    }

    pub fn mark_started(&self) {
        let mut started = self
            .started
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started.get_or_insert_with(Instant::now);
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages: BTreeMap<String, StageSnapshot> = self
            .stages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, metrics)| {
                (
                    id.clone(),
                    StageSnapshot {
                        stage_id: metrics.stage_id().to_string(),
                        processed: metrics.processed(),
                        errors: metrics.errors(),
                        retries: metrics.retries(),
                        bytes: metrics.bytes(),
                        avg_latency_us: metrics.avg_latency_us(),
                    },
                )
            })
            .collect();

        let duration = self.elapsed();
        let processed = self.run.acked();
        let errors = self.run.errors();
        let throughput = if duration.as_secs_f64() > 0.0 {
            processed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        MetricsSnapshot {
            processed,
            batches_read: self.run.batches_read(),
            dropped: self.run.dropped(),
            errors,
            retries: stages.values().map(|s| s.retries).sum(),
            bytes_in: self.run.bytes_in(),
            bytes_out: self.run.bytes_out(),
            cache_hits: self.run.cache_hits(),
            cache_misses: self.run.cache_misses(),
            peak_in_flight: self.run.peak_in_flight(),
            duration,
            throughput,
            error_rate: error_rate(errors, processed + errors),
            stages,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
