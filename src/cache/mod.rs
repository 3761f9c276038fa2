pub mod clock;
pub mod disk;
pub mod entry;
pub mod key;
pub mod manager;
pub mod memory;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::{DiskTier, IndexRecord};
pub use entry::CacheEntry;
pub use key::CacheKey;
pub use manager::{CacheManager, CacheStats};
pub use memory::MemoryTier;
pub use policy::CachePolicy;
