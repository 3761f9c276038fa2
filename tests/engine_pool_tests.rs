use async_trait::async_trait;
use lakepipe::cache::CacheManager;
use lakepipe::config::ExecutorConfig;
use lakepipe::core::{Ack, Batch, Column, Sink, Table};
use lakepipe::engine::{PipelineBuilder, PipelineGraph, PipelinePool};
use lakepipe::error::{ConfigError, SinkError};
use lakepipe::processors::{FnTransform, MemorySource};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sink that tracks how many pipelines are writing at once.
#[derive(Clone, Default)]
struct GaugeSink {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    written: Arc<AtomicUsize>,
}

#[async_trait]
impl Sink for GaugeSink {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn write(&self, batch: &Batch) -> Result<Ack, SinkError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(Ack::for_batch(batch))
    }
}

fn graph(table: &str, sink: &GaugeSink) -> PipelineGraph {
    let tables =
        (1..=3).map(|i| Table::new().with_column("v", Column::Int64(vec![i])));
    PipelineBuilder::new()
        .source(MemorySource::from_tables(table, tables).immutable())
        .transform(FnTransform::new("noop", "v1", |b: Batch| Ok(vec![b])))
        .sink(sink.clone())
        .build()
        .unwrap()
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        max_in_flight: 1,
        ..ExecutorConfig::default()
    }
}

#[tokio::test]
async fn test_pool_bounds_concurrent_pipelines() {
    let pool = PipelinePool::new(config(), 2).unwrap();
    let sink = GaugeSink::default();

    let graphs = (0..6).map(|i| graph(&format!("t{i}"), &sink)).collect();
    let results = pool.run_all(graphs).await;

    assert_eq!(results.len(), 6);
    for result in &results {
        assert_eq!(result.as_ref().unwrap().metrics.processed, 3);
    }
    assert_eq!(sink.written.load(Ordering::SeqCst), 18);
    // one in-flight batch per pipeline, two pipelines at a time
    assert!(sink.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.available(), 2);
}

#[tokio::test]
async fn test_pool_shares_cache_between_runs() {
    let cache = Arc::new(CacheManager::in_memory(
        NonZeroUsize::new(1024).unwrap(),
        Duration::from_secs(60),
    ));
    let pool = PipelinePool::new(config(), 3).unwrap().with_cache(cache.clone());
    let sink = GaugeSink::default();

    let first = pool
        .run_all((0..3).map(|i| graph(&format!("t{i}"), &sink)).collect())
        .await;
    assert!(first.iter().all(|r| r.is_ok()));
    assert_eq!(cache.stats().memory_entries, 9);

    let second = pool
        .run_all((0..3).map(|i| graph(&format!("t{i}"), &sink)).collect())
        .await;
    for result in second {
        assert_eq!(result.unwrap().metrics.cache_hits, 3);
    }
}

#[test]
fn test_pool_rejects_zero_concurrency() {
    let result = PipelinePool::new(config(), 0);
    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    assert_eq!(PipelinePool::new(config(), 4).unwrap().max_concurrent(), 4);
}
