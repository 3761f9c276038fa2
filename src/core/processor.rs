use super::{Batch, Checkpoint, Split};
use crate::engine::Composition;
use crate::error::{SinkError, SourceError, TransformError};
use async_trait::async_trait;
use std::sync::Arc;

/// Durable acceptance of a batch by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub source_key: String,
    pub sequence: u64,
}

impl Ack {
    pub fn for_batch(batch: &Batch) -> Self {
        Self {
            source_key: batch.source_key().to_string(),
            sequence: batch.sequence(),
        }
    }
}

/// Producer of batches. Finite for bounded reads, infinite for feeds.
///
/// Reading is split in two so the executor can consult the cache between
/// the listing and the fetch: `next_split` is the cheap step, `fetch` does
/// the I/O and must be idempotent because it is retried with the same split.
#[async_trait]
pub trait Source: Send {
    fn name(&self) -> &str;

    /// Describes read-side configuration (projection, decode options...).
    fn fingerprint(&self) -> String {
        self.name().to_string()
    }

    /// Next split to read, or `None` once a bounded source is exhausted.
    async fn next_split(&mut self) -> Option<Result<Split, SourceError>>;

    async fn fetch(&mut self, split: &Split) -> Result<Batch, SourceError>;

    /// Last split handed out by `next_split`.
    fn checkpoint(&self) -> Option<Checkpoint>;

    /// Reposition so the next split follows `checkpoint`.
    async fn resume_from(&mut self, _checkpoint: &Checkpoint) -> Result<(), SourceError> {
        Err(SourceError::Unsupported(format!(
            "source `{}` cannot resume from a checkpoint",
            self.name()
        )))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Batch-to-batches function. Returning an empty vec filters the input out.
///
/// Must not rely on state shared with other stages; the same input always
/// produces the same output, which is why the executor never retries it.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Changes whenever the transform's configuration changes. Part of the
    /// cache key, so two differently configured transforms never share entries.
    fn fingerprint(&self) -> String;

    async fn apply(&self, batch: Batch) -> Result<Vec<Batch>, TransformError>;
}

/// Terminal consumer. `Ok(Ack)` means the batch is durably accepted.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, batch: &Batch) -> Result<Ack, SinkError>;

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// The closed set of roles a pipeline stage can play.
pub enum Processor {
    Source(Box<dyn Source>),
    Transform(Arc<dyn Transform>),
    Composite(Composition),
    Sink(Arc<dyn Sink>),
}

impl Processor {
    pub fn source(source: impl Source + 'static) -> Self {
        Self::Source(Box::new(source))
    }

    pub fn transform(transform: impl Transform + 'static) -> Self {
        Self::Transform(Arc::new(transform))
    }

    pub fn sink(sink: impl Sink + 'static) -> Self {
        Self::Sink(Arc::new(sink))
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Transform(_) => "transform",
            Self::Composite(_) => "composite",
            Self::Sink(_) => "sink",
        }
    }
}

impl From<Composition> for Processor {
    fn from(composition: Composition) -> Self {
        Self::Composite(composition)
    }
}
