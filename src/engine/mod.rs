pub mod composition;
pub mod executor;
pub mod graph;
pub mod pool;
pub mod state;

pub use composition::{Composition, JoinMode};
pub use executor::{Executor, PipelineResult, RunReport};
pub use graph::{PipelineBuilder, PipelineGraph};
pub use pool::PipelinePool;
pub use state::ExecutorState;
