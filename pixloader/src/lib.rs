//! pixloader - remote image loading with two-tier caching.
//!
//! Loads images over the network and serves them to display consumers
//! through a bounded in-memory cache backed by a persistent, journaled disk
//! cache. Requests run on an owned worker pool; results are marshalled back
//! to a single consumer thread with staleness detection.
//!
//! # Example
//!
//! ```ignore
//! use pixloader::{Loader, LoaderConfig, Slot};
//!
//! // Build on the consumer (UI) thread
//! let loader = Loader::build(LoaderConfig::new());
//! let deliveries = loader.take_deliveries().unwrap();
//!
//! let slot = Slot::new(|locator, pixmap| {
//!     println!("{locator}: {}x{}", pixmap.width(), pixmap.height());
//! });
//! loader.bind_sized("http://example.com/a.png", &slot, 256, 256);
//!
//! // On the consumer thread, apply results as they arrive
//! deliveries.poll();
//! ```

pub mod cache;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod fetch;
pub mod key;
pub mod loader;
pub mod pixmap;
pub mod platform;

pub use cache::{CacheError, CacheStats, DiskCache, DiskCacheConfig, MemoryCache, MemoryCacheConfig};
pub use config::LoaderConfig;
pub use decode::{decode, DecodeError};
pub use dispatch::{PoolConfig, WorkerPool};
pub use fetch::{copy_stream, FetchError, HttpClient, ReqwestClient, IO_BUF_SIZE};
pub use key::{CacheKey, KeyDeriver, KeyStrategy};
pub use loader::{Deliveries, Loader, LoaderResult, Slot};
pub use pixmap::Pixmap;
pub use platform::{CacheDirProvider, FixedDirProvider, SystemDirProvider};
