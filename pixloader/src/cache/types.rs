//! Shared cache types and per-tier configuration.

use thiserror::Error;

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error during cache operations
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid cache configuration
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Memory cache configuration.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum aggregate pixmap weight in KiB.
    ///
    /// Default: one eighth of total system memory.
    pub budget_kb: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            budget_kb: default_memory_budget_kb(),
        }
    }
}

impl MemoryCacheConfig {
    /// Set the memory budget in KiB.
    pub fn with_budget_kb(mut self, budget_kb: usize) -> Self {
        self.budget_kb = budget_kb;
        self
    }
}

/// One eighth of total system memory, in KiB.
///
/// Falls back to 64 MiB worth of KiB when the probe reports nothing.
fn default_memory_budget_kb() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_bytes = system.total_memory();
    if total_bytes == 0 {
        64 * 1024
    } else {
        (total_bytes / 8 / 1024) as usize
    }
}

/// Disk cache configuration.
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// Maximum aggregate size of committed values in bytes (default: 50 MiB).
    pub budget_bytes: u64,
    /// Schema version; changing it invalidates all persisted entries.
    pub schema_version: u32,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 50 * 1024 * 1024,
            schema_version: 1,
        }
    }
}

impl DiskCacheConfig {
    /// Set the disk budget in bytes.
    pub fn with_budget_bytes(mut self, budget_bytes: u64) -> Self {
        self.budget_bytes = budget_bytes;
        self
    }

    /// Set the schema version.
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}
