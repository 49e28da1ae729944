//! Memory system: durable, multiply indexed knowledge records
//!
//! Memory files are the source of truth; `index.yaml` and `timeline.yaml`
//! are derived caches that can always be rebuilt from them.

pub mod index;
pub mod store;
pub mod types;

pub use index::{MemoryIndex, Timeline, TimelineEntry};
pub use store::{MemoryRepository, RebuildReport, TemporalContext};
pub use types::{Memory, MemoryContext, MemoryLinks, MemoryQuery, MemoryStatus, MemoryType, NewMemory};
