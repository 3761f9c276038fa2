use std::sync::Arc;

use lakepipe::core::{Column, Table};
use lakepipe::engine::{Composition, Executor, PipelineBuilder};
use lakepipe::observability::{MetricsCollector, PipelineMonitor};
use lakepipe::processors::{FilterTransform, FnTransform, LogSink, MemorySource, ProjectTransform};
use lakepipe::{CacheManager, PipelineConfig};
use tracing_subscriber::EnvFilter;

fn partition(day: i64) -> Table {
    let amounts: Vec<f64> = (0..8).map(|i| (day * 10 + i) as f64 * 1.5).collect();
    Table::new()
        .with_column("day", Column::Int64(vec![day; 8]))
        .with_column("amount", Column::Float64(amounts))
        .with_column("note", Column::Utf8(vec!["historical".to_string(); 8]))
}

fn build_pipeline(cache: Arc<CacheManager>) -> anyhow::Result<lakepipe::engine::PipelineGraph> {
    let mut source = MemorySource::new("sales").immutable();
    for day in 1..=5 {
        source = source.with_partition(format!("warehouse/sales/day={day}"), partition(day));
    }

    let doubled = FnTransform::map("double_amount", "x2", |table: &Table| {
        let amounts: Vec<f64> = match table.column("amount") {
            Some(Column::Float64(v)) => v.iter().map(|a| a * 2.0).collect(),
            _ => Vec::new(),
        };
        Ok(table.clone().with_column("amount", Column::Float64(amounts)))
    });
    let odd_days = FilterTransform::new("odd_days", "day%2==1", |batch| batch.sequence() % 2 == 1);

    let graph = PipelineBuilder::new()
        .source(source)
        .then(Composition::sequential(
            Composition::transform(odd_days),
            Composition::transform(doubled),
        ))
        .transform(ProjectTransform::new(["day", "amount"]))
        .sink(LogSink::new("console"))
        .cache(cache)
        .build()?;
    Ok(graph)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cache_dir = std::env::temp_dir().join("lakepipe_demo_cache");
    let config = PipelineConfig::from_json(serde_json::json!({
        "executor": {
            "max_in_flight": 4,
            "error_policy": { "mode": "fail_fast" },
            "retry": { "max_attempts": 3, "base_delay_ms": 50 },
            "sink_timeout_ms": 5000
        },
        "cache": {
            "dir": cache_dir,
            "max_disk_size": "64MB",
            "memory_capacity": 32,
            "ttl_secs": 3600
        }
    }))?;

    let cache = Arc::new(CacheManager::open(&config.cache).await?);

    // second pass is served from the cache
    for pass in 1..=2 {
        let collector = MetricsCollector::new();
        let executor = Executor::new(build_pipeline(cache.clone())?, config.executor.clone())?
            .with_collector(collector.clone());

        let report = executor.run().await?;
        tracing::info!(pass, checkpoint = ?report.checkpoint, "Run finished");
        println!("{}", PipelineMonitor::new(collector).generate_report());
    }

    let stats = cache.stats();
    println!(
        "Cache: {} hits, {} misses, {} on disk ({} bytes)",
        stats.hits, stats.misses, stats.disk_entries, stats.disk_bytes
    );
    cache.close().await;
    Ok(())
}
