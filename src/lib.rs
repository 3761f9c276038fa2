pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod observability;
pub mod processors;
pub mod resilience;

pub use crate::cache::CacheManager;
pub use crate::config::PipelineConfig;
pub use crate::core::{Batch, Processor, Sink, Source, Transform};
pub use crate::engine::{Composition, Executor, PipelineBuilder, PipelineResult};
pub use crate::error::{PipelineError, RunFailure};
