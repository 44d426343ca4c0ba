//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! DirectCache (shared lock: store/get/release, exclusive lock: compaction)
//!   ├─→ SlotTable         slot → Handle(slot, generation, buffer, start, len)
//!   ├─→ MemorySpaceIndex  buffer → { Large chain, Fragment chain } of FreeRange
//!   └─→ BufferDataStore   buffer → raw region (own lock) + scratch region
//!
//! Maintenance (tokio tasks)
//!   ├─→ CompactionDriver  1s tick, 10s cooldown, repacks one buffer
//!   └─→ coalescing        folds fragments into touching large ranges
//! ```
//!
//! Regions come from a `RegionProvider`: anonymous memory maps by default,
//! heap vectors for small caches and tests.

pub mod bench;
pub mod buffer;
pub mod cache;
pub mod compaction;
pub mod handle;
mod maintenance;
pub mod metrics;
pub mod range;
pub mod region;
pub mod size_class;
pub mod slot;
pub mod space_index;
pub mod status;

pub use buffer::{BufferDataStore, BufferUsage};
pub use cache::{CacheStats, DirectCache};
pub use compaction::{CompactionDriver, CompactionReport};
pub use handle::Handle;
pub use metrics::CacheMetrics;
pub use range::{AddressOrder, FreeRange};
pub use region::{
    AnonymousRegionProvider, HeapRegionProvider, MemoryBudget, RawRegion, RegionProvider,
};
pub use size_class::SizeClass;
pub use slot::SlotTable;
pub use space_index::{ChainStats, CoalesceReport, MemorySpaceIndex, SpaceStats};
pub use status::human_size;
