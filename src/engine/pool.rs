use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{Executor, PipelineGraph, PipelineResult};
use crate::cache::CacheManager;
use crate::config::ExecutorConfig;
use crate::error::{ConfigError, PipelineError, RunFailure};
use crate::observability::MetricsSnapshot;

/// Runs independent pipelines concurrently, each with its own executor.
///
/// The only thing runs share is the cache handed to [`PipelinePool::with_cache`].
pub struct PipelinePool {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    cache: Option<Arc<CacheManager>>,
}

fn failed_before_start(error: PipelineError) -> RunFailure {
    RunFailure {
        error,
        acked: 0,
        metrics: MetricsSnapshot::default(),
        checkpoint: None,
    }
}

impl PipelinePool {
    pub fn new(config: ExecutorConfig, max_concurrent: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        if max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be at least 1"));
        }

        Ok(Self {
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            cache: None,
        })
    }

    /// Attach `cache` to every submitted graph that has none of its own.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn execute(&self, mut graph: PipelineGraph) -> JoinHandle<PipelineResult> {
        let config = self.config.clone();
        let semaphore = self.semaphore.clone();
        if graph.cache.is_none() {
            graph.cache = self.cache.clone();
        }

        tokio::spawn(async move {
            // Acquire permit (waits if max_concurrent already running)
            let _permit = semaphore.acquire_owned().await.map_err(|_| {
                failed_before_start(PipelineError::Internal("pipeline pool closed".to_string()))
            })?;

            let executor = Executor::new(graph, config)
                .map_err(|e| failed_before_start(PipelineError::Config(e)))?;
            executor.run().await
        })
    }

    /// Submit every graph and wait for all of them, results in input order.
    pub async fn run_all(&self, graphs: Vec<PipelineGraph>) -> Vec<PipelineResult> {
        let handles: Vec<_> = graphs.into_iter().map(|g| self.execute(g)).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| {
                Err(failed_before_start(PipelineError::Internal(format!(
                    "pipeline task panicked: {e}"
                ))))
            }));
        }
        results
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
