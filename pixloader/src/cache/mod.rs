//! Two-tier cache: bounded in-memory pixmap store plus a journaled,
//! persistent byte store on disk.
//!
//! Both tiers are size-weighted with least-recently-used eviction and are
//! indexed by the same derived [`CacheKey`](crate::key::CacheKey).

mod disk;
mod memory;
mod stats;
mod types;

pub use disk::{DiskCache, ReadHandle, WriteHandle};
pub use memory::MemoryCache;
pub use stats::CacheStats;
pub use types::{CacheError, DiskCacheConfig, MemoryCacheConfig};
