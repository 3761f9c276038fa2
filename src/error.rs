//! Error families for every stage of a pipeline run.
//!
//! Source, transform and sink errors travel through the result chain and are
//! judged by the executor's error policy. Cache errors never leave the cache
//! manager; they are logged and treated as misses. Config errors are raised
//! before any processor runs.

use std::time::Duration;

use thiserror::Error;

use crate::core::Checkpoint;
use crate::observability::MetricsSnapshot;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("source call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SourceError {
    /// Fetch, connect and timeout failures may succeed on a re-fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Connect(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("computation failed: {0}")]
    Computation(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Write(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Connect(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid include/exclude pattern: {0}")]
    Pattern(#[from] globset::Error),
    #[error("invalid cache config: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("contradictory configuration: {0}")]
    Contradiction(String),
    #[error("malformed configuration: {0}")]
    Malformed(String),
    #[error("invalid pipeline graph: {0}")]
    Graph(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Terminal error of a run, tagged with the stage it came from.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("source `{stage}`: {error}")]
    Source { stage: String, error: SourceError },
    #[error("transform `{stage}`: {error}")]
    Transform { stage: String, error: TransformError },
    #[error("sink `{stage}`: {error}")]
    Sink { stage: String, error: SinkError },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("error rate {rate:.3} exceeded threshold {threshold:.3}")]
    ErrorRateExceeded { rate: f64, threshold: f64 },
    #[error("internal executor failure: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn source(stage: impl Into<String>, error: SourceError) -> Self {
        Self::Source {
            stage: stage.into(),
            error,
        }
    }

    pub fn transform(stage: impl Into<String>, error: TransformError) -> Self {
        Self::Transform {
            stage: stage.into(),
            error,
        }
    }

    pub fn sink(stage: impl Into<String>, error: SinkError) -> Self {
        Self::Sink {
            stage: stage.into(),
            error,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Source {
                error: SourceError::Timeout(_),
                ..
            } | Self::Sink {
                error: SinkError::Timeout(_),
                ..
            }
        )
    }
}

/// Failure side of a pipeline result: the first fatal error plus what was
/// already durably delivered before it.
#[derive(Debug, Clone, Error)]
#[error("pipeline failed after {acked} acked batches: {error}")]
pub struct RunFailure {
    pub error: PipelineError,
    pub acked: u64,
    pub metrics: MetricsSnapshot,
    pub checkpoint: Option<Checkpoint>,
}
