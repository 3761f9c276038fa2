pub mod batch;
pub mod processor;
pub mod result;

pub use batch::{Batch, Checkpoint, Column, Split, Table};
pub use processor::{Ack, Processor, Sink, Source, Transform};
pub use result::{chain_results, collect_results, ResultExt};
