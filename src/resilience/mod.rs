pub mod policy;
pub mod resilient_sink;

pub use policy::{ErrorPolicy, RetryPolicy, Verdict};
pub use resilient_sink::ResilientSink;
