//! Built-in sources, transforms and sinks.

pub mod collect_sink;
pub mod generator;
pub mod log_sink;
pub mod memory_source;
pub mod transforms;

pub use collect_sink::CollectSink;
pub use generator::GeneratorSource;
pub use log_sink::LogSink;
pub use memory_source::MemorySource;
pub use transforms::{FilterTransform, FnTransform, ProjectTransform};
