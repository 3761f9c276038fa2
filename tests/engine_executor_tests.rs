use async_trait::async_trait;
use lakepipe::config::ExecutorConfig;
use lakepipe::core::{Batch, Checkpoint, Column, Source, Split, Table};
use lakepipe::engine::{Executor, ExecutorState, PipelineBuilder, PipelineGraph};
use lakepipe::error::{PipelineError, SourceError, TransformError};
use lakepipe::observability::MetricsCollector;
use lakepipe::processors::{CollectSink, FilterTransform, FnTransform, GeneratorSource, MemorySource};
use lakepipe::resilience::{ErrorPolicy, RetryPolicy};
use std::time::Duration;
use tokio::time::timeout;

fn tables(n: i64) -> Vec<Table> {
    (1..=n)
        .map(|i| Table::new().with_column("v", Column::Int64(vec![i])))
        .collect()
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        max_in_flight: 4,
        retry: RetryPolicy::attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        ..ExecutorConfig::default()
    }
}

fn fail_on(sequence: u64) -> FnTransform {
    FnTransform::new("validate", "v1", move |batch: Batch| {
        if batch.sequence() == sequence {
            Err(TransformError::Computation("bad row".to_string()))
        } else {
            Ok(vec![batch])
        }
    })
}

fn fail_on_even() -> FnTransform {
    FnTransform::new("validate", "even", |batch: Batch| {
        if batch.sequence() % 2 == 0 {
            Err(TransformError::Computation("bad row".to_string()))
        } else {
            Ok(vec![batch])
        }
    })
}

fn build(source: MemorySource, transform: FnTransform, sink: &CollectSink) -> PipelineGraph {
    PipelineBuilder::new()
        .source(source)
        .transform(transform)
        .sink(sink.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_filter_drops_evens() {
    let sink = CollectSink::new("out");
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("mem", tables(5)))
        .transform(FilterTransform::new("odd", "v1", |b| b.sequence() % 2 == 1))
        .sink(sink.clone())
        .build()
        .unwrap();

    let report = Executor::new(graph, config()).unwrap().run().await.unwrap();

    assert_eq!(sink.sequences(), vec![1, 3, 5]);
    assert_eq!(report.metrics.processed, 3);
    assert_eq!(report.metrics.batches_read, 5);
    assert_eq!(report.metrics.errors, 0);
    assert_eq!(report.checkpoint.map(|c| c.sequence), Some(5));
}

#[tokio::test]
async fn test_fail_fast_keeps_only_earlier_acks() {
    let sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(5)), fail_on(3), &sink);

    let executor = Executor::new(graph, config()).unwrap();
    let state = executor.subscribe_state();
    let failure = executor.run().await.unwrap_err();

    assert_eq!(sink.sequences(), vec![1, 2]);
    assert_eq!(failure.acked, 2);
    match &failure.error {
        PipelineError::Transform { stage, error } => {
            assert_eq!(stage, "validate");
            assert_eq!(error, &TransformError::Computation("bad row".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(failure.checkpoint.map(|c| c.sequence), Some(2));
    assert!(matches!(*state.borrow(), ExecutorState::Failed { .. }));
}

#[tokio::test]
async fn test_sequences_arrive_in_order() {
    let sink = CollectSink::new("out").with_delay(Duration::from_millis(1));
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("mem", tables(20)))
        .sink(sink.clone())
        .build()
        .unwrap();

    Executor::new(graph, config()).unwrap().run().await.unwrap();

    assert_eq!(sink.sequences(), (1..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_in_flight_never_exceeds_bound() {
    let sink = CollectSink::new("slow").with_delay(Duration::from_millis(5));
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("fast", tables(30)))
        .sink(sink.clone())
        .build()
        .unwrap();
    let config = ExecutorConfig {
        max_in_flight: 3,
        ..config()
    };

    let collector = MetricsCollector::new();
    let executor = Executor::new(graph, config)
        .unwrap()
        .with_collector(collector.clone());
    let report = executor.run().await.unwrap();

    assert_eq!(sink.len(), 30);
    assert!(report.metrics.peak_in_flight <= 3);
    assert!(report.metrics.peak_in_flight >= 1);
    assert_eq!(collector.run().in_flight(), 0);
}

#[tokio::test]
async fn test_fan_out_rides_on_one_permit_per_split() {
    let sink = CollectSink::new("slow").with_delay(Duration::from_millis(2));
    let explode = FnTransform::new("explode", "x4", |batch: Batch| {
        Ok((0..4).map(|i| batch.clone().with_metadata("part", i.to_string())).collect())
    });
    let config = ExecutorConfig {
        max_in_flight: 1,
        ..config()
    };

    let report = Executor::new(build(MemorySource::from_tables("mem", tables(3)), explode, &sink), config)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(sink.len(), 12);
    assert_eq!(report.metrics.processed, 12);
    assert_eq!(report.metrics.peak_in_flight, 1);
    assert_eq!(report.checkpoint.unwrap().sequence, 3);
}

#[tokio::test]
async fn test_sink_retry_delivers_exactly_once() {
    let sink = CollectSink::new("flaky").failing_first(2);
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("mem", tables(1)))
        .sink(sink.clone())
        .build()
        .unwrap();

    let report = Executor::new(graph, config()).unwrap().run().await.unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink.attempts(), 3);
    assert_eq!(report.metrics.processed, 1);
    assert_eq!(report.metrics.retries, 2);
}

#[tokio::test]
async fn test_sink_retries_exhausted_fails_run() {
    let sink = CollectSink::new("flaky").failing_first(5);
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("mem", tables(1)))
        .sink(sink.clone())
        .build()
        .unwrap();

    let failure = Executor::new(graph, config()).unwrap().run().await.unwrap_err();

    assert!(matches!(failure.error, PipelineError::Sink { .. }));
    assert_eq!(sink.attempts(), 3);
    assert_eq!(failure.acked, 0);
    assert_eq!(failure.checkpoint, None);
}

struct FlakySource {
    inner: MemorySource,
    failures_left: u32,
}

#[async_trait]
impl Source for FlakySource {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn next_split(&mut self) -> Option<Result<Split, SourceError>> {
        self.inner.next_split().await
    }

    async fn fetch(&mut self, split: &Split) -> Result<Batch, SourceError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(SourceError::Fetch("connection reset".to_string()));
        }
        self.inner.fetch(split).await
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.inner.checkpoint()
    }
}

#[tokio::test]
async fn test_source_fetch_is_retried() {
    let sink = CollectSink::new("out");
    let source = FlakySource {
        inner: MemorySource::from_tables("mem", tables(2)),
        failures_left: 2,
    };
    let graph = PipelineBuilder::new()
        .source(source)
        .sink(sink.clone())
        .build()
        .unwrap();

    let report = Executor::new(graph, config()).unwrap().run().await.unwrap();

    assert_eq!(sink.sequences(), vec![1, 2]);
    assert_eq!(report.metrics.stages["source:flaky"].retries, 2);
}

#[tokio::test]
async fn test_transform_errors_are_never_retried() {
    let sink = CollectSink::new("out");
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counted = calls.clone();
    let transform = FnTransform::new("always_bad", "v1", move |_batch: Batch| {
        counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(TransformError::InvalidInput("schema".to_string()))
    });
    let graph = build(MemorySource::from_tables("mem", tables(1)), transform, &sink);

    let failure = Executor::new(graph, config()).unwrap().run().await.unwrap_err();

    assert!(matches!(failure.error, PipelineError::Transform { .. }));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_skip_policy_drops_and_continues() {
    let sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(5)), fail_on_even(), &sink);
    let config = ExecutorConfig {
        error_policy: ErrorPolicy::Skip,
        ..config()
    };

    let report = Executor::new(graph, config).unwrap().run().await.unwrap();

    assert_eq!(sink.sequences(), vec![1, 3, 5]);
    assert_eq!(report.metrics.errors, 2);
    assert_eq!(report.metrics.dropped, 2);
    assert_eq!(report.checkpoint.map(|c| c.sequence), Some(5));
}

#[tokio::test]
async fn test_tolerant_policy_aborts_over_threshold() {
    let sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(10)), fail_on_even(), &sink);
    // one unit in flight makes the attempted count exact at each failure
    let config = ExecutorConfig {
        max_in_flight: 1,
        error_policy: ErrorPolicy::Tolerant {
            max_error_rate: 0.3,
            min_samples: 4,
        },
        ..config()
    };

    let failure = Executor::new(graph, config).unwrap().run().await.unwrap_err();

    match failure.error {
        PipelineError::ErrorRateExceeded { rate, threshold } => {
            assert!((rate - 0.5).abs() < f64::EPSILON);
            assert!((threshold - 0.3).abs() < f64::EPSILON);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(sink.sequences(), vec![1, 3]);
    assert_eq!(failure.metrics.dropped, 1);
    assert_eq!(failure.checkpoint.map(|c| c.sequence), Some(3));
}

#[tokio::test]
async fn test_resume_continues_after_checkpoint() {
    let first_sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(5)), fail_on(3), &first_sink);
    let failure = Executor::new(graph, config()).unwrap().run().await.unwrap_err();
    let checkpoint = failure.checkpoint.unwrap();
    assert_eq!(checkpoint.sequence, 2);

    let second_sink = CollectSink::new("out");
    let graph = build(
        MemorySource::from_tables("mem", tables(5)),
        fail_on(99),
        &second_sink,
    );
    let report = Executor::new(graph, config())
        .unwrap()
        .resume_from(checkpoint)
        .run()
        .await
        .unwrap();

    assert_eq!(second_sink.sequences(), vec![3, 4, 5]);
    assert_eq!(report.checkpoint.map(|c| c.sequence), Some(5));
}

#[tokio::test]
async fn test_cancellation_drains_infinite_source() {
    let sink = CollectSink::new("out");
    let graph = PipelineBuilder::new()
        .source(GeneratorSource::new("feed", 4).with_interval(Duration::from_millis(1)))
        .sink(sink.clone())
        .build()
        .unwrap();

    let executor = Executor::new(graph, config()).unwrap();
    let token = executor.cancellation_token();
    let state = executor.subscribe_state();
    let handle = tokio::spawn(executor.run());

    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let report = timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not stop after cancellation")
        .unwrap()
        .unwrap();

    assert!(!sink.is_empty());
    assert_eq!(report.metrics.processed, sink.len() as u64);
    assert_eq!(*state.borrow(), ExecutorState::Completed);
    // every delivered batch was acked in order
    let sequences = sink.sequences();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_sink_timeout_is_an_error_not_a_hang() {
    let sink = CollectSink::new("stuck").with_delay(Duration::from_millis(500));
    let graph = PipelineBuilder::new()
        .source(MemorySource::from_tables("mem", tables(1)))
        .sink(sink.clone())
        .build()
        .unwrap();
    let config = ExecutorConfig {
        retry: RetryPolicy::none(),
        sink_timeout_ms: Some(20),
        ..config()
    };

    let failure = timeout(
        Duration::from_secs(5),
        Executor::new(graph, config).unwrap().run(),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(failure.error.is_timeout());
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_invalid_config_rejected_before_run() {
    let sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(1)), fail_on(99), &sink);
    let config = ExecutorConfig {
        max_in_flight: 0,
        ..config()
    };

    assert!(Executor::new(graph, config).is_err());
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test]
async fn test_state_reaches_completed() {
    let sink = CollectSink::new("out");
    let graph = build(MemorySource::from_tables("mem", tables(2)), fail_on(99), &sink);
    let executor = Executor::new(graph, config()).unwrap();
    assert_eq!(executor.state(), ExecutorState::Idle);
    let state = executor.subscribe_state();

    executor.run().await.unwrap();

    assert_eq!(*state.borrow(), ExecutorState::Completed);
}
