//! Loader configuration.

use crate::cache::{DiskCacheConfig, MemoryCacheConfig};
use crate::dispatch::PoolConfig;

/// Complete loader configuration.
///
/// Defaults: memory budget of one eighth of system memory, a 50 MiB disk
/// budget at schema version 1, and a CPU-scaled worker pool.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Memory tier configuration.
    pub memory: MemoryCacheConfig,
    /// Disk tier configuration.
    pub disk: DiskCacheConfig,
    /// Worker pool sizing.
    pub pool: PoolConfig,
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory budget in KiB.
    pub fn with_memory_budget_kb(mut self, budget_kb: usize) -> Self {
        self.memory.budget_kb = budget_kb;
        self
    }

    /// Set the disk budget in bytes.
    pub fn with_disk_budget_bytes(mut self, budget_bytes: u64) -> Self {
        self.disk.budget_bytes = budget_bytes;
        self
    }

    /// Set the disk schema version.
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.disk.schema_version = schema_version;
        self
    }

    /// Set the worker pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}
