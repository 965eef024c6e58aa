//! In-memory pixmap cache with size-weighted LRU eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::stats::CacheStats;
use crate::key::CacheKey;
use crate::pixmap::Pixmap;

/// Entry in the memory cache.
struct MemoryEntry {
    pixmap: Arc<Pixmap>,
    weight_kb: usize,
    /// Access sequence stamp for LRU ordering.
    last_used: u64,
}

struct MemoryState {
    entries: HashMap<CacheKey, MemoryEntry>,
    total_kb: usize,
    /// Monotone access counter; higher means more recently used.
    seq: u64,
}

/// Bounded in-memory cache of decoded pixmaps.
///
/// Entries are weighted by pixel footprint (`row_bytes * height / 1024`) and
/// evicted least-recently-used first once the aggregate weight exceeds the
/// budget. Shared read/write across worker threads and the consumer thread.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    budget_kb: usize,
    stats: Mutex<CacheStats>,
}

impl MemoryCache {
    /// Create a memory cache with the given weight budget in KiB.
    pub fn new(budget_kb: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                total_kb: 0,
                seq: 0,
            }),
            budget_kb,
            stats: Mutex::new(CacheStats::new()),
        }
    }

    /// Get a cached pixmap, marking the entry as most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Pixmap>> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let stamp = state.seq;

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used = stamp;
            let pixmap = Arc::clone(&entry.pixmap);
            self.stats.lock().unwrap().record_memory_hit();
            Some(pixmap)
        } else {
            self.stats.lock().unwrap().record_memory_miss();
            None
        }
    }

    /// Insert a pixmap under `key`.
    ///
    /// First writer wins: when the key is already present the stored pixmap
    /// is kept and only its recency is refreshed. Inserting past the budget
    /// evicts least-recently-used entries until the aggregate weight fits.
    pub fn put(&self, key: CacheKey, pixmap: Arc<Pixmap>) {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let stamp = state.seq;

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_used = stamp;
            return;
        }

        let weight_kb = pixmap.weight_kb();
        state.entries.insert(
            key,
            MemoryEntry {
                pixmap,
                weight_kb,
                last_used: stamp,
            },
        );
        state.total_kb += weight_kb;

        let evicted = Self::evict_to_budget(&mut state, self.budget_kb);

        let mut stats = self.stats.lock().unwrap();
        if evicted > 0 {
            stats.record_memory_eviction(evicted);
        }
        stats.memory_weight_kb = state.total_kb;
        stats.memory_entry_count = state.entries.len();
    }

    /// Check if a key is present without touching recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Current number of entries.
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Current aggregate weight in KiB.
    pub fn weight_kb(&self) -> usize {
        self.state.lock().unwrap().total_kb
    }

    /// Configured weight budget in KiB.
    pub fn budget_kb(&self) -> usize {
        self.budget_kb
    }

    /// Snapshot of this tier's statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap().clone()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.total_kb = 0;

        let mut stats = self.stats.lock().unwrap();
        stats.memory_weight_kb = 0;
        stats.memory_entry_count = 0;
    }

    /// Evict least-recently-used entries until total weight fits the budget.
    ///
    /// Returns the number of entries evicted.
    fn evict_to_budget(state: &mut MemoryState, budget_kb: usize) -> u64 {
        let mut evicted = 0;
        while state.total_kb > budget_kb {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };

            if let Some(entry) = state.entries.remove(&key) {
                state.total_kb = state.total_kb.saturating_sub(entry.weight_kb);
                evicted += 1;
                tracing::debug!(key = %key, weight_kb = entry.weight_kb, "memory cache evicted");
            }
        }
        evicted
    }
}
