//! Drives one pipeline run.
//!
//! The run is split into three tokio tasks linked by bounded channels:
//!
//! ```text
//! source task ──mpsc──▶ transform task ──mpsc──▶ sink task
//! (split, cache,        (stages in order)         (write, ack,
//!  fetch + retry)                                  checkpoint)
//! ```
//!
//! A unit takes one semaphore permit before its split is even listed and
//! gives it back when the sink acks it or it is discarded, so at most
//! `max_in_flight` units exist between source and sink at any time. The
//! window counts source splits: when a transform fans one split out into
//! several batches, they all travel to the sink on that split's permit and
//! the permit is returned once the last of them is acked. The
//! checkpoint is only advanced by the sink task, in order, which keeps it
//! behind every unit that has not been acked or deliberately dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{Composition, ExecutorState, PipelineGraph};
use crate::cache::{CacheKey, CacheManager};
use crate::config::ExecutorConfig;
use crate::core::{Batch, Checkpoint, Sink, Source, Split};
use crate::error::{ConfigError, PipelineError, RunFailure, SourceError};
use crate::observability::{MetricsCollector, MetricsSnapshot, RunMetrics, StageMetrics};
use crate::resilience::{ErrorPolicy, ResilientSink, Verdict};

/// Success side of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub metrics: MetricsSnapshot,
    /// Last position whose unit was acked or deliberately dropped
    pub checkpoint: Option<Checkpoint>,
}

pub type PipelineResult = Result<RunReport, RunFailure>;

/// One permit of the in-flight window. Dropping it frees the slot.
struct Slot {
    _permit: OwnedSemaphorePermit,
    run: Arc<RunMetrics>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, run: Arc<RunMetrics>) -> Self {
        run.enter_flight();
        Self {
            _permit: permit,
            run,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.run.leave_flight();
    }
}

enum Unit {
    Deliver {
        split: Split,
        batches: Vec<Batch>,
        slot: Slot,
    },
    /// Failed and dropped under a tolerant policy; still advances the checkpoint
    Dropped { split: Split, slot: Slot },
}

/// State shared by the three tasks of a run.
struct RunContext {
    config: ExecutorConfig,
    run: Arc<RunMetrics>,
    cache: Option<Arc<CacheManager>>,
    fingerprint: String,
    cancel: CancellationToken,
    /// Child of `cancel`, also tripped by the first fatal error
    halt: CancellationToken,
    fatal: Mutex<Option<PipelineError>>,
    attempted: AtomicU64,
    state: watch::Sender<ExecutorState>,
}

impl RunContext {
    fn transition(&self, next: ExecutorState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                tracing::info!(from = current.name(), to = next.name(), "Executor state change");
                *current = next;
                true
            } else {
                tracing::debug!(
                    from = current.name(),
                    to = next.name(),
                    "Ignored state transition"
                );
                false
            }
        })
    }

    fn fail(&self, error: PipelineError) {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if fatal.is_some() {
                tracing::debug!(error = %error, "Further failure after run already failed");
                return;
            }
            tracing::error!(error = %error, "Pipeline run failed");
            *fatal = Some(error.clone());
        }
        self.transition(ExecutorState::Failed {
            error_msg: error.to_string(),
        });
        self.halt.cancel();
    }

    fn take_fatal(&self) -> Option<PipelineError> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Count a failed unit and apply the error policy to it.
    fn judge(&self, error: PipelineError) -> Verdict {
        let errors = self.run.record_error();
        let attempted = self.attempted.load(Ordering::Acquire);
        let verdict = self.config.error_policy.judge(errors, attempted);

        match verdict {
            Verdict::Drop => {
                tracing::warn!(error = %error, errors, attempted, "Dropping failed batch");
            }
            Verdict::Abort => match &self.config.error_policy {
                ErrorPolicy::Tolerant { max_error_rate, .. } => {
                    tracing::warn!(error = %error, "Error rate threshold crossed");
                    self.fail(PipelineError::ErrorRateExceeded {
                        rate: crate::resilience::policy::error_rate(errors, attempted),
                        threshold: *max_error_rate,
                    });
                }
                _ => self.fail(error),
            },
        }
        verdict
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, call: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(SourceError::Timeout(limit))),
        None => call.await,
    }
}

pub struct Executor {
    graph: PipelineGraph,
    config: ExecutorConfig,
    collector: MetricsCollector,
    cancel: CancellationToken,
    state: watch::Sender<ExecutorState>,
    resume: Option<Checkpoint>,
}

impl Executor {
    pub fn new(graph: PipelineGraph, config: ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(ExecutorState::Idle);
        Ok(Self {
            graph,
            config,
            collector: MetricsCollector::new(),
            cancel: CancellationToken::new(),
            state,
            resume: None,
        })
    }

    /// Report into a caller-owned collector instead of a private one.
    pub fn with_collector(mut self, collector: MetricsCollector) -> Self {
        self.collector = collector;
        self
    }

    /// Ask the source to continue after `checkpoint` when the run starts.
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    /// Cancelling this token moves the run to `Draining`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ExecutorState {
        self.state.borrow().clone()
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    pub async fn run(self) -> PipelineResult {
        let Executor {
            graph,
            config,
            collector,
            cancel,
            state,
            resume,
        } = self;
        let fingerprint = graph.fingerprint();
        let PipelineGraph {
            mut source,
            stages,
            sink,
            cache,
        } = graph;

        let capacity = config.max_in_flight;
        let ctx = Arc::new(RunContext {
            run: collector.run().clone(),
            cache,
            fingerprint,
            halt: cancel.child_token(),
            cancel,
            fatal: Mutex::new(None),
            attempted: AtomicU64::new(0),
            state,
            config,
        });

        ctx.transition(ExecutorState::Running);
        collector.mark_started();
        tracing::info!(
            source = source.name(),
            sink = sink.name(),
            stages = stages.len(),
            max_in_flight = capacity,
            "Starting pipeline run"
        );

        if let Some(checkpoint) = &resume {
            if let Err(e) = source.resume_from(checkpoint).await {
                ctx.fail(PipelineError::source(source.name(), e));
            } else {
                tracing::info!(
                    source_key = %checkpoint.source_key,
                    sequence = checkpoint.sequence,
                    "Resumed source from checkpoint"
                );
            }
        }

        let source_metrics = collector.register(format!("source:{}", source.name()));
        let stage_metrics: Vec<Arc<StageMetrics>> = stages
            .iter()
            .map(|stage| collector.register(format!("transform:{}", stage.name())))
            .collect();
        let sink_metrics = collector.register(format!("sink:{}", sink.name()));
        let sink = ResilientSink::new(
            sink,
            sink_metrics,
            ctx.config.retry.clone(),
            ctx.config.sink_timeout(),
        );

        let (fetched_tx, fetched_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let semaphore = Arc::new(Semaphore::new(capacity));

        let source_task = tokio::spawn(run_source(
            source,
            source_metrics,
            semaphore,
            ctx.clone(),
            fetched_tx,
        ));
        let transform_task = tokio::spawn(run_transforms(
            stages,
            stage_metrics,
            ctx.clone(),
            fetched_rx,
            out_tx,
        ));
        let sink_task = tokio::spawn(run_sink(sink, ctx.clone(), out_rx, resume));

        let (source_done, transform_done, sink_done) =
            tokio::join!(source_task, transform_task, sink_task);
        for (task, done) in [("source", source_done), ("transform", transform_done)] {
            if let Err(e) = done {
                ctx.fail(PipelineError::Internal(format!("{task} task panicked: {e}")));
            }
        }
        let checkpoint = match sink_done {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                ctx.fail(PipelineError::Internal(format!("sink task panicked: {e}")));
                None
            }
        };

        let metrics = collector.snapshot();
        match ctx.take_fatal() {
            None => {
                ctx.transition(ExecutorState::Draining);
                ctx.transition(ExecutorState::Completed);
                tracing::info!(
                    acked = metrics.processed,
                    dropped = metrics.dropped,
                    errors = metrics.errors,
                    "Pipeline run completed"
                );
                Ok(RunReport {
                    metrics,
                    checkpoint,
                })
            }
            Some(error) => Err(RunFailure {
                error,
                acked: metrics.processed,
                metrics,
                checkpoint,
            }),
        }
    }
}

async fn run_source(
    mut source: Box<dyn Source>,
    metrics: Arc<StageMetrics>,
    semaphore: Arc<Semaphore>,
    ctx: Arc<RunContext>,
    tx: mpsc::Sender<Unit>,
) {
    let name = source.name().to_string();
    let limit = ctx.config.source_timeout();

    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.halt.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let slot = Slot::new(permit, ctx.run.clone());

        let next = tokio::select! {
            biased;
            _ = ctx.halt.cancelled() => break,
            next = with_timeout(limit, async { source.next_split().await.transpose() }) => next,
        };
        let split = match next {
            Ok(Some(split)) => split,
            Ok(None) => {
                tracing::debug!(source = %name, "Source exhausted");
                break;
            }
            Err(e) => {
                ctx.attempted.fetch_add(1, Ordering::AcqRel);
                metrics.record_error();
                match ctx.judge(PipelineError::source(&name, e)) {
                    Verdict::Abort => break,
                    Verdict::Drop => continue,
                }
            }
        };
        ctx.attempted.fetch_add(1, Ordering::AcqRel);

        let key = ctx
            .cache
            .as_ref()
            .filter(|cache| cache.should_cache(&split))
            .map(|_| CacheKey::derive(&split.source_key, &ctx.fingerprint));

        if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
            if let Some(batch) = cache.get(key).await {
                // the stored batch may come from a run that read this partition elsewhere
                let batch = batch.at_split(&split);
                ctx.run.record_cache_hit();
                ctx.run.record_read(batch.size_bytes());
                tracing::debug!(source_key = %split.source_key, sequence = split.sequence, "Cache hit");
                let unit = Unit::Deliver {
                    split,
                    batches: vec![batch],
                    slot,
                };
                if tx.send(unit).await.is_err() {
                    break;
                }
                continue;
            }
            ctx.run.record_cache_miss();
        }

        let start = metrics.start_timer();
        let mut attempt = 1;
        let fetched = loop {
            match with_timeout(limit, source.fetch(&split)).await {
                Ok(batch) => break Ok(batch),
                Err(e) if e.is_retryable() && ctx.config.retry.should_retry(attempt) => {
                    let delay = ctx.config.retry.delay_for(attempt);
                    tracing::warn!(
                        source = %name,
                        sequence = split.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source fetch failed, retrying"
                    );
                    metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        let unit = match fetched {
            Ok(batch) => {
                metrics.observe_latency(start);
                metrics.record_processed(batch.size_bytes());
                ctx.run.record_read(batch.size_bytes());
                if let (Some(cache), Some(key)) = (&ctx.cache, &key) {
                    cache.put(key, &batch, cache.default_ttl()).await;
                }
                Unit::Deliver {
                    split,
                    batches: vec![batch],
                    slot,
                }
            }
            Err(e) => {
                metrics.record_error();
                match ctx.judge(PipelineError::source(&name, e)) {
                    Verdict::Abort => break,
                    Verdict::Drop => Unit::Dropped { split, slot },
                }
            }
        };
        if tx.send(unit).await.is_err() {
            break;
        }
    }

    if ctx.cancel.is_cancelled() {
        tracing::info!(source = %name, "Cancellation observed, source stopped");
    }
    ctx.transition(ExecutorState::Draining);
    if let Err(e) = source.close().await {
        tracing::warn!(source = %name, error = %e, "Source close failed");
    }
}

async fn run_transforms(
    stages: Vec<Composition>,
    metrics: Vec<Arc<StageMetrics>>,
    ctx: Arc<RunContext>,
    mut rx: mpsc::Receiver<Unit>,
    tx: mpsc::Sender<Unit>,
) {
    let mut last_sequence: Option<(String, u64)> = None;

    while let Some(unit) = rx.recv().await {
        let unit = match unit {
            dropped @ Unit::Dropped { .. } => dropped,
            Unit::Deliver {
                split,
                batches,
                slot,
            } => {
                if let Some((key, previous)) = &last_sequence {
                    if split.sequence < *previous {
                        tracing::warn!(
                            previous_key = %key,
                            previous,
                            source_key = %split.source_key,
                            sequence = split.sequence,
                            "Sequence regression at first transform"
                        );
                    }
                }
                last_sequence = Some((split.source_key.clone(), split.sequence));

                match apply_stages(&stages, &metrics, batches).await {
                    Ok(batches) => Unit::Deliver {
                        split,
                        batches,
                        slot,
                    },
                    Err(e) => match ctx.judge(e) {
                        Verdict::Abort => break,
                        Verdict::Drop => Unit::Dropped { split, slot },
                    },
                }
            }
        };
        if tx.send(unit).await.is_err() {
            break;
        }
    }
}

async fn apply_stages(
    stages: &[Composition],
    metrics: &[Arc<StageMetrics>],
    mut current: Vec<Batch>,
) -> Result<Vec<Batch>, PipelineError> {
    for (stage, metrics) in stages.iter().zip(metrics) {
        let mut next = Vec::with_capacity(current.len());
        for batch in current {
            let bytes = batch.size_bytes();
            let start = metrics.start_timer();
            match stage.apply(batch).await {
                Ok(outputs) => {
                    metrics.observe_latency(start);
                    metrics.record_processed(bytes);
                    next.extend(outputs);
                }
                Err(e) => {
                    metrics.record_error();
                    return Err(e);
                }
            }
        }
        if next.is_empty() {
            return Ok(next);
        }
        current = next;
    }
    Ok(current)
}

async fn run_sink(
    sink: ResilientSink,
    ctx: Arc<RunContext>,
    mut rx: mpsc::Receiver<Unit>,
    resume: Option<Checkpoint>,
) -> Option<Checkpoint> {
    let mut committed = resume;

    while let Some(unit) = rx.recv().await {
        match unit {
            Unit::Dropped { split, slot } => {
                ctx.run.record_dropped();
                committed = Some(split.checkpoint());
                drop(slot);
            }
            Unit::Deliver {
                split,
                batches,
                slot,
            } => {
                let mut failure = None;
                for batch in &batches {
                    match sink.write(batch).await {
                        Ok(ack) => {
                            ctx.run.record_ack(batch.size_bytes());
                            tracing::debug!(
                                source_key = %ack.source_key,
                                sequence = ack.sequence,
                                "Batch acked"
                            );
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                if let Some(e) = failure {
                    match ctx.judge(PipelineError::sink(sink.name(), e)) {
                        Verdict::Abort => break,
                        Verdict::Drop => ctx.run.record_dropped(),
                    }
                }
                committed = Some(split.checkpoint());
                drop(slot);
            }
        }
    }

    if let Err(e) = sink.close().await {
        tracing::warn!(sink = sink.name(), error = %e, "Sink close failed");
    }
    committed
}
