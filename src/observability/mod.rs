pub mod collector;
pub mod metrics;
pub mod monitor;

pub use collector::{MetricsCollector, MetricsSnapshot, StageSnapshot};
pub use metrics::{RunMetrics, StageMetrics};
pub use monitor::PipelineMonitor;
