//! Persistent disk cache with a journal, atomic commit/abort writes, and
//! size-weighted LRU eviction.
//!
//! # Layout
//!
//! The backing directory holds a text `journal` plus one value file per
//! entry (`<key>.0`; a single value slot per entry in this design). Writes
//! stream into `<key>.0.tmp` and become visible only when [`WriteHandle::commit`]
//! renames the temporary file over the value file. The journal records entry
//! state transitions:
//!
//! ```text
//! pixloader.DiskCache
//! 1
//! <schema version>
//! 1
//!
//! DIRTY <key>
//! CLEAN <key> <size>
//! READ <key>
//! REMOVE <key>
//! ```
//!
//! Replaying the journal on open rebuilds the index; a `DIRTY` record with no
//! following `CLEAN`/`REMOVE` marks a write interrupted by a crash, which is
//! rolled back (temporary file deleted, any previously committed value kept).
//! Opening with a different schema version wipes the directory first.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::stats::CacheStats;
use crate::cache::types::{CacheError, DiskCacheConfig};
use crate::key::CacheKey;

const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP_FILE: &str = "journal.tmp";
const MAGIC: &str = "pixloader.DiskCache";
const JOURNAL_VERSION: &str = "1";
/// Value slots per entry; this design stores a single blob per key.
const VALUE_SLOTS: usize = 1;

const OP_DIRTY: &str = "DIRTY";
const OP_CLEAN: &str = "CLEAN";
const OP_READ: &str = "READ";
const OP_REMOVE: &str = "REMOVE";

/// Journal records that carry no index change accumulate until the journal
/// is rewritten in compact form.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

#[derive(Debug)]
struct DiskEntry {
    size_bytes: u64,
    /// A committed value file exists for this entry.
    committed: bool,
    /// A writer currently holds this entry (at most one per key).
    writing: bool,
    last_used: u64,
}

struct DiskState {
    entries: HashMap<CacheKey, DiskEntry>,
    journal: BufWriter<File>,
    total_bytes: u64,
    seq: u64,
    redundant_ops: usize,
}

/// Bounded, persistent, LRU byte store.
///
/// All mutation goes through this type's interface; readers never observe a
/// partially written value. Safe for concurrent use from worker threads.
pub struct DiskCache {
    directory: PathBuf,
    budget_bytes: u64,
    schema_version: u32,
    state: Mutex<DiskState>,
    stats: Mutex<CacheStats>,
}

impl DiskCache {
    /// Open (or create) a disk cache in `directory`.
    ///
    /// Fails when the directory cannot be created or the journal cannot be
    /// written. A persisted schema version different from
    /// `config.schema_version` invalidates all prior entries.
    pub fn open(directory: &Path, config: DiskCacheConfig) -> Result<Self, CacheError> {
        if config.budget_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "disk budget must be non-zero".into(),
            ));
        }
        fs::create_dir_all(directory)?;

        let journal_path = directory.join(JOURNAL_FILE);
        let mut replayed = None;
        if journal_path.exists() {
            match replay_journal(&journal_path, config.schema_version) {
                Ok(state) => replayed = state,
                Err(err) => {
                    tracing::warn!(error = %err, "unreadable journal, rebuilding disk cache");
                }
            }
        }

        let replayed_some = replayed.is_some();
        let (mut entries, redundant_ops) = match replayed {
            Some(replay) => (replay.entries, replay.redundant_ops),
            None => {
                // Schema change, corruption, or first run: start empty.
                wipe_cache_files(directory)?;
                (HashMap::new(), 0)
            }
        };

        rollback_dirty_entries(directory, &mut entries);
        sweep_orphan_files(directory, &entries);

        let total_bytes = entries.values().map(|e| e.size_bytes).sum();
        // Resume the access sequence above every replayed stamp
        let seq = entries.values().map(|e| e.last_used).max().unwrap_or(0);

        if !replayed_some {
            write_fresh_journal(directory, config.schema_version, &entries)?;
        }

        let journal = OpenOptions::new().append(true).open(&journal_path)?;
        let cache = Self {
            directory: directory.to_path_buf(),
            budget_bytes: config.budget_bytes,
            schema_version: config.schema_version,
            state: Mutex::new(DiskState {
                entries,
                journal: BufWriter::new(journal),
                total_bytes,
                seq,
                redundant_ops,
            }),
            stats: Mutex::new(CacheStats::new()),
        };

        {
            // Budget may have shrunk since the last run
            let mut state = cache.state.lock().unwrap();
            let evicted = cache.evict_to_budget(&mut state);
            if evicted > 0 {
                tracing::info!(evicted, "disk cache trimmed to budget on open");
            }
            if cache.should_compact(&state) {
                cache.compact_journal(&mut state)?;
            }
            let mut stats = cache.stats.lock().unwrap();
            stats.record_disk_eviction(evicted);
            stats.disk_size_bytes = state.total_bytes;
            stats.disk_entry_count = state.entries.values().filter(|e| e.committed).count();
        }

        tracing::debug!(
            directory = %directory.display(),
            entries = cache.entry_count(),
            size_bytes = cache.size_bytes(),
            "disk cache opened"
        );
        Ok(cache)
    }

    /// Get a read handle for the committed value of `key`.
    ///
    /// The handle exposes the value file itself; the bytes it reads are
    /// always a complete committed value.
    pub fn get(&self, key: &CacheKey) -> Option<ReadHandle> {
        let mut state = self.state.lock().unwrap();

        let committed = state
            .entries
            .get(key)
            .map(|entry| entry.committed)
            .unwrap_or(false);
        if !committed {
            self.stats.lock().unwrap().record_disk_miss();
            return None;
        }

        match File::open(self.value_path(key)) {
            Ok(file) => {
                state.seq += 1;
                let stamp = state.seq;
                let size_bytes = {
                    let entry = state.entries.get_mut(key).expect("entry checked above");
                    entry.last_used = stamp;
                    entry.size_bytes
                };
                if let Err(err) = self.append_record(&mut state, format!("{OP_READ} {key}")) {
                    tracing::warn!(error = %err, "failed to journal cache read");
                }
                self.stats.lock().unwrap().record_disk_hit();
                Some(ReadHandle { file, size_bytes })
            }
            Err(err) => {
                // Value file lost out from under the index; drop the entry.
                tracing::warn!(key = %key, error = %err, "cached value unreadable, dropping entry");
                self.remove_entry(&mut state, key);
                self.stats.lock().unwrap().record_disk_miss();
                None
            }
        }
    }

    /// Begin writing a new value for `key`.
    ///
    /// Returns `None` when a writer for this key is already in flight (at
    /// most one concurrent writer per key) or the temporary file cannot be
    /// created. Until [`WriteHandle::commit`], readers keep seeing the
    /// previous committed value (or nothing).
    pub fn begin_write(&self, key: &CacheKey) -> Option<WriteHandle<'_>> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let stamp = state.seq;

        let entry = state.entries.entry(key.clone()).or_insert(DiskEntry {
            size_bytes: 0,
            committed: false,
            writing: false,
            last_used: stamp,
        });
        if entry.writing {
            tracing::debug!(key = %key, "write already in progress, rejecting second writer");
            return None;
        }

        let tmp_path = self.tmp_path(key);
        let file = match File::create(&tmp_path) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "failed to create write buffer file");
                let entry = state.entries.get(key).expect("entry inserted above");
                if !entry.committed {
                    state.entries.remove(key);
                }
                return None;
            }
        };

        state.entries.get_mut(key).expect("entry inserted above").writing = true;
        if let Err(err) = self.append_record(&mut state, format!("{OP_DIRTY} {key}")) {
            tracing::warn!(error = %err, "failed to journal write start");
        }

        Some(WriteHandle {
            cache: self,
            key: key.clone(),
            tmp_path,
            file: Some(file),
            bytes_written: 0,
            finished: false,
        })
    }

    /// Force the journal to durable storage.
    pub fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        state.journal.flush()?;
        state.journal.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.entries.values().filter(|e| e.committed).count()
    }

    /// Aggregate size of committed values in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    /// Configured size budget in bytes.
    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Schema version this cache was opened with.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Snapshot of this tier's statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap().clone()
    }

    /// Delete every entry and reset the journal.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<CacheKey> = state.entries.keys().cloned().collect();
        for key in keys {
            let _ = fs::remove_file(self.value_path(&key));
            let _ = fs::remove_file(self.tmp_path(&key));
        }
        state.entries.clear();
        state.total_bytes = 0;
        self.compact_journal(&mut state)?;

        let mut stats = self.stats.lock().unwrap();
        stats.disk_size_bytes = 0;
        stats.disk_entry_count = 0;
        Ok(())
    }

    fn value_path(&self, key: &CacheKey) -> PathBuf {
        self.directory.join(format!("{key}.0"))
    }

    fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        self.directory.join(format!("{key}.0.tmp"))
    }

    /// Drop an entry from the index and journal, deleting its value file.
    ///
    /// When a writer is in flight for the key, only the stale committed
    /// value is forgotten; the slot itself stays for the writer to finish.
    fn remove_entry(&self, state: &mut DiskState, key: &CacheKey) {
        let Some((writing, committed, size)) = state
            .entries
            .get(key)
            .map(|e| (e.writing, e.committed, e.size_bytes))
        else {
            return;
        };

        if writing {
            if committed {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.committed = false;
                    entry.size_bytes = 0;
                }
                state.total_bytes = state.total_bytes.saturating_sub(size);
                let _ = fs::remove_file(self.value_path(key));
                if let Err(err) = self.append_record(state, format!("{OP_REMOVE} {key}")) {
                    tracing::warn!(error = %err, "failed to journal entry removal");
                }
            }
            return;
        }

        state.entries.remove(key);
        if committed {
            state.total_bytes = state.total_bytes.saturating_sub(size);
        }
        let _ = fs::remove_file(self.value_path(key));
        if let Err(err) = self.append_record(state, format!("{OP_REMOVE} {key}")) {
            tracing::warn!(error = %err, "failed to journal entry removal");
        }
    }

    /// Evict least-recently-used committed entries until within budget.
    ///
    /// Entries with a writer in flight are skipped. Returns the count evicted.
    fn evict_to_budget(&self, state: &mut DiskState) -> u64 {
        let mut evicted = 0;
        while state.total_bytes > self.budget_bytes {
            let victim = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.committed && !entry.writing)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else { break };

            tracing::debug!(key = %key, "disk cache evicting");
            self.remove_entry(state, &key);
            evicted += 1;
        }
        evicted
    }

    /// Append a journal record, compacting the journal when it has
    /// accumulated enough redundant history.
    fn append_record(&self, state: &mut DiskState, record: String) -> io::Result<()> {
        writeln!(state.journal, "{record}")?;
        state.journal.flush()?;
        state.redundant_ops += 1;
        if self.should_compact(state) {
            if let Err(err) = self.compact_journal(state) {
                tracing::warn!(error = %err, "journal compaction failed");
            }
        }
        Ok(())
    }

    fn should_compact(&self, state: &DiskState) -> bool {
        state.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && state.redundant_ops >= state.entries.len()
    }

    /// Rewrite the journal to contain only the current index.
    fn compact_journal(&self, state: &mut DiskState) -> Result<(), CacheError> {
        state.journal.flush()?;
        write_fresh_journal(&self.directory, self.schema_version, &state.entries)?;
        let journal = OpenOptions::new()
            .append(true)
            .open(self.directory.join(JOURNAL_FILE))?;
        state.journal = BufWriter::new(journal);
        state.redundant_ops = 0;
        tracing::debug!(entries = state.entries.len(), "journal compacted");
        Ok(())
    }

    /// Called by a write handle on commit, after the rename has happened.
    fn finish_commit(&self, key: &CacheKey, new_size: u64) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let stamp = state.seq;

        // The slot may have been dropped by a concurrent clear(); recreate it
        let previous = {
            let entry = state.entries.entry(key.clone()).or_insert(DiskEntry {
                size_bytes: 0,
                committed: false,
                writing: false,
                last_used: stamp,
            });
            let previous = entry.committed.then_some(entry.size_bytes);
            entry.size_bytes = new_size;
            entry.committed = true;
            entry.writing = false;
            entry.last_used = stamp;
            previous
        };
        if let Some(old) = previous {
            state.total_bytes = state.total_bytes.saturating_sub(old);
        }
        state.total_bytes += new_size;

        self.append_record(&mut state, format!("{OP_CLEAN} {key} {new_size}"))?;
        let evicted = self.evict_to_budget(&mut state);

        let mut stats = self.stats.lock().unwrap();
        stats.record_disk_write();
        stats.record_disk_eviction(evicted);
        stats.disk_size_bytes = state.total_bytes;
        stats.disk_entry_count = state.entries.values().filter(|e| e.committed).count();
        Ok(())
    }

    /// Called by a write handle on abort (or drop without commit).
    fn finish_abort(&self, key: &CacheKey) {
        let mut state = self.state.lock().unwrap();
        let (committed, size) = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.writing = false;
                (entry.committed, entry.size_bytes)
            }
            None => return,
        };
        let record = if committed {
            // Reassert the previous committed value
            format!("{OP_CLEAN} {key} {size}")
        } else {
            state.entries.remove(key);
            format!("{OP_REMOVE} {key}")
        };
        if let Err(err) = self.append_record(&mut state, record) {
            tracing::warn!(error = %err, "failed to journal write abort");
        }
    }
}

/// Handle to a committed value, backed by the value file's descriptor.
pub struct ReadHandle {
    file: File,
    size_bytes: u64,
}

impl ReadHandle {
    /// Size of the committed value in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Read the whole value into memory.
    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size_bytes as usize);
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// In-flight write for one key.
///
/// Bytes stream into a temporary file and are published atomically by
/// [`commit`](Self::commit); [`abort`](Self::abort) (or dropping the handle)
/// discards them, leaving the entry exactly as it was before the write began.
pub struct WriteHandle<'a> {
    cache: &'a DiskCache,
    key: CacheKey,
    tmp_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    finished: bool,
}

impl WriteHandle<'_> {
    /// Bytes written through this handle so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Atomically publish the written bytes as the entry's new value.
    pub fn commit(mut self) -> Result<(), CacheError> {
        self.finished = true;

        let file = self.file.take().expect("file present until finished");
        let sync_result = file.sync_all();
        drop(file);
        if let Err(err) = sync_result {
            self.discard();
            return Err(err.into());
        }

        let value_path = self.cache.value_path(&self.key);
        if let Err(err) = fs::rename(&self.tmp_path, &value_path) {
            self.discard();
            return Err(err.into());
        }

        self.cache.finish_commit(&self.key, self.bytes_written)
    }

    /// Discard all bytes written so far; the entry keeps its previous
    /// committed value, or stays absent if it had none.
    pub fn abort(mut self) {
        self.finished = true;
        self.discard();
    }

    fn discard(&mut self) {
        self.file = None;
        let _ = fs::remove_file(&self.tmp_path);
        self.cache.finish_abort(&self.key);
    }
}

impl Write for WriteHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write handle finished"))?;
        let written = file.write(buf)?;
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.discard();
        }
    }
}

struct ReplayedJournal {
    entries: HashMap<CacheKey, DiskEntry>,
    redundant_ops: usize,
}

/// Parse and replay the journal.
///
/// Returns `Ok(None)` when the header does not match (wrong magic, journal
/// format, schema version, or slot count), which callers treat as a wipe.
fn replay_journal(
    journal_path: &Path,
    schema_version: u32,
) -> io::Result<Option<ReplayedJournal>> {
    let mut reader = BufReader::new(File::open(journal_path)?);

    let mut header = Vec::with_capacity(5);
    for _ in 0..5 {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        header.push(line);
    }
    if header[0] != MAGIC
        || header[1] != JOURNAL_VERSION
        || header[2] != schema_version.to_string()
        || header[3] != VALUE_SLOTS.to_string()
        || !header[4].is_empty()
    {
        tracing::info!("journal header mismatch, invalidating disk cache contents");
        return Ok(None);
    }

    let mut entries: HashMap<CacheKey, DiskEntry> = HashMap::new();
    let mut seq = 0u64;
    let mut ops = 0usize;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break, // truncated tail from a crash
        };
        let mut parts = line.split(' ');
        let (op, key) = match (parts.next(), parts.next()) {
            (Some(op), Some(key)) if !key.is_empty() => (op, parse_key(key)),
            _ => break,
        };
        ops += 1;
        seq += 1;
        match op {
            OP_DIRTY => {
                entries
                    .entry(key)
                    .or_insert(DiskEntry {
                        size_bytes: 0,
                        committed: false,
                        writing: false,
                        last_used: seq,
                    })
                    .writing = true;
            }
            OP_CLEAN => {
                let Some(size) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                    break;
                };
                let entry = entries.entry(key).or_insert(DiskEntry {
                    size_bytes: 0,
                    committed: false,
                    writing: false,
                    last_used: seq,
                });
                entry.size_bytes = size;
                entry.committed = true;
                entry.writing = false;
                entry.last_used = seq;
            }
            OP_READ => {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.last_used = seq;
                }
            }
            OP_REMOVE => {
                entries.remove(&key);
            }
            _ => break,
        }
    }

    let redundant_ops = ops.saturating_sub(entries.len());
    Ok(Some(ReplayedJournal {
        entries,
        redundant_ops,
    }))
}

/// Keys are stored verbatim in the journal; reconstruct them through the
/// same newtype the index uses.
fn parse_key(raw: &str) -> CacheKey {
    // CacheKey is only constructed by derivation; journal replay goes
    // through the same hex/decimal text the deriver produced.
    crate::key::replayed_key(raw)
}

/// Roll back entries whose last record was `DIRTY`: delete the temporary
/// file and keep only a previously committed value, if any.
fn rollback_dirty_entries(directory: &Path, entries: &mut HashMap<CacheKey, DiskEntry>) {
    let dirty: Vec<CacheKey> = entries
        .iter()
        .filter(|(_, entry)| entry.writing)
        .map(|(key, _)| key.clone())
        .collect();
    for key in dirty {
        let _ = fs::remove_file(directory.join(format!("{key}.0.tmp")));
        let committed = {
            let entry = entries.get_mut(&key).expect("collected above");
            entry.writing = false;
            entry.committed
        };
        if !committed {
            entries.remove(&key);
        }
        tracing::debug!(key = %key, "rolled back interrupted write");
    }
}

/// Delete value/tmp files that no live entry references.
fn sweep_orphan_files(directory: &Path, entries: &HashMap<CacheKey, DiskEntry>) {
    let Ok(dir) = fs::read_dir(directory) else {
        return;
    };
    for dir_entry in dir.flatten() {
        let path = dir_entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == JOURNAL_FILE || name == JOURNAL_TMP_FILE {
            continue;
        }
        // Only files following the cache's own naming scheme are swept
        let Some(raw) = name
            .strip_suffix(".0.tmp")
            .or_else(|| name.strip_suffix(".0"))
        else {
            continue;
        };
        let live = name.ends_with(".0")
            && entries
                .get(&parse_key(raw))
                .map(|e| e.committed)
                .unwrap_or(false);
        if !live {
            tracing::debug!(file = name, "removing orphan cache file");
            let _ = fs::remove_file(&path);
        }
    }
}

/// Write a compact journal (header + current index) via tmp-and-rename.
fn write_fresh_journal(
    directory: &Path,
    schema_version: u32,
    entries: &HashMap<CacheKey, DiskEntry>,
) -> io::Result<()> {
    let tmp_path = directory.join(JOURNAL_TMP_FILE);
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writeln!(writer, "{MAGIC}")?;
        writeln!(writer, "{JOURNAL_VERSION}")?;
        writeln!(writer, "{schema_version}")?;
        writeln!(writer, "{VALUE_SLOTS}")?;
        writeln!(writer)?;

        // Preserve LRU order so the next replay reconstructs recency
        let mut ordered: Vec<(&CacheKey, &DiskEntry)> = entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.last_used);
        for (key, entry) in ordered {
            if entry.writing {
                writeln!(writer, "{OP_DIRTY} {key}")?;
            }
            if entry.committed {
                writeln!(writer, "{OP_CLEAN} {key} {}", entry.size_bytes)?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, directory.join(JOURNAL_FILE))?;
    Ok(())
}

/// Remove every cache-owned file from the directory.
fn wipe_cache_files(directory: &Path) -> io::Result<()> {
    for dir_entry in fs::read_dir(directory)?.flatten() {
        let path = dir_entry.path();
        if path.is_file() {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyDeriver, KeyStrategy};
    use tempfile::TempDir;

    fn test_key(n: u32) -> CacheKey {
        KeyDeriver::with_strategy(KeyStrategy::Digest).derive(&format!("http://example.com/{n}"))
    }

    fn open_cache(dir: &Path, budget: u64) -> DiskCache {
        DiskCache::open(dir, DiskCacheConfig::default().with_budget_bytes(budget)).unwrap()
    }

    fn put(cache: &DiskCache, key: &CacheKey, data: &[u8]) {
        let mut handle = cache.begin_write(key).expect("no writer in flight");
        handle.write_all(data).unwrap();
        handle.commit().unwrap();
    }

    fn get_vec(cache: &DiskCache, key: &CacheKey) -> Option<Vec<u8>> {
        cache.get(key).map(|h| h.read_to_vec().unwrap())
    }

    #[test]
    fn test_open_creates_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("cache");
        let cache = open_cache(&dir, 10_000_000);
        assert!(dir.is_dir());
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let temp = TempDir::new().unwrap();
        let result = DiskCache::open(
            temp.path(),
            DiskCacheConfig::default().with_budget_bytes(0),
        );
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        put(&cache, &key, b"hello disk");

        assert_eq!(get_vec(&cache, &key), Some(b"hello disk".to_vec()));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.size_bytes(), 10);
    }

    #[test]
    fn test_get_absent_returns_none() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        assert!(cache.get(&test_key(1)).is_none());
    }

    #[test]
    fn test_uncommitted_write_is_invisible() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        let mut handle = cache.begin_write(&key).unwrap();
        handle.write_all(b"not yet visible").unwrap();

        assert!(cache.get(&key).is_none());
        handle.commit().unwrap();
        assert_eq!(get_vec(&cache, &key), Some(b"not yet visible".to_vec()));
    }

    #[test]
    fn test_single_writer_per_key() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        let first = cache.begin_write(&key).unwrap();
        assert!(cache.begin_write(&key).is_none());

        // Other keys are unaffected
        assert!(cache.begin_write(&test_key(2)).is_some());

        first.abort();
        assert!(cache.begin_write(&key).is_some());
    }

    #[test]
    fn test_abort_leaves_entry_absent() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        let mut handle = cache.begin_write(&key).unwrap();
        handle.write_all(b"discarded").unwrap();
        handle.abort();

        assert!(cache.get(&key).is_none());
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_abort_keeps_previous_value() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        put(&cache, &key, b"version one");

        let mut handle = cache.begin_write(&key).unwrap();
        handle.write_all(b"version two, interrupted").unwrap();
        handle.abort();

        assert_eq!(get_vec(&cache, &key), Some(b"version one".to_vec()));
    }

    #[test]
    fn test_dropped_handle_aborts() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        {
            let mut handle = cache.begin_write(&key).unwrap();
            handle.write_all(b"dropped on the floor").unwrap();
        }

        assert!(cache.get(&key).is_none());
        assert!(cache.begin_write(&key).is_some());
    }

    #[test]
    fn test_commit_replaces_previous_value() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        put(&cache, &key, b"old value");
        put(&cache, &key, b"new");

        assert_eq!(get_vec(&cache, &key), Some(b"new".to_vec()));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.size_bytes(), 3);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let key = test_key(1);

        {
            let cache = open_cache(temp.path(), 10_000_000);
            put(&cache, &key, b"survives restart");
        }
        {
            let cache = open_cache(temp.path(), 10_000_000);
            assert_eq!(cache.entry_count(), 1);
            assert_eq!(get_vec(&cache, &key), Some(b"survives restart".to_vec()));
        }
    }

    #[test]
    fn test_interrupted_write_rolled_back_on_reopen() {
        let temp = TempDir::new().unwrap();
        let key = test_key(1);

        {
            let cache = open_cache(temp.path(), 10_000_000);
            let mut handle = cache.begin_write(&key).unwrap();
            handle.write_all(b"half-writ").unwrap();
            // Simulate a crash: neither commit nor abort runs
            std::mem::forget(handle);
        }

        let cache = open_cache(temp.path(), 10_000_000);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.entry_count(), 0);
        assert!(!temp.path().join(format!("{key}.0.tmp")).exists());
    }

    #[test]
    fn test_interrupted_rewrite_keeps_previous_value() {
        let temp = TempDir::new().unwrap();
        let key = test_key(1);

        {
            let cache = open_cache(temp.path(), 10_000_000);
            put(&cache, &key, b"committed value");
            let mut handle = cache.begin_write(&key).unwrap();
            handle.write_all(b"partial replacement").unwrap();
            std::mem::forget(handle);
        }

        let cache = open_cache(temp.path(), 10_000_000);
        assert_eq!(get_vec(&cache, &key), Some(b"committed value".to_vec()));
    }

    #[test]
    fn test_lru_eviction_on_commit() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 2500);

        put(&cache, &test_key(1), &[1u8; 1000]);
        put(&cache, &test_key(2), &[2u8; 1000]);
        put(&cache, &test_key(3), &[3u8; 1000]);

        assert!(cache.size_bytes() <= 2500);
        assert!(cache.get(&test_key(1)).is_none(), "oldest entry evicted");
        assert!(cache.get(&test_key(2)).is_some());
        assert!(cache.get(&test_key(3)).is_some());
        assert!(cache.stats().disk_evictions > 0);
    }

    #[test]
    fn test_read_refreshes_recency() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 2500);

        put(&cache, &test_key(1), &[1u8; 1000]);
        put(&cache, &test_key(2), &[2u8; 1000]);
        assert!(cache.get(&test_key(1)).is_some());

        put(&cache, &test_key(3), &[3u8; 1000]);

        assert!(cache.get(&test_key(1)).is_some(), "recently read entry kept");
        assert!(cache.get(&test_key(2)).is_none(), "LRU entry evicted");
    }

    #[test]
    fn test_recency_survives_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let cache = open_cache(temp.path(), 10_000_000);
            put(&cache, &test_key(1), &[1u8; 1000]);
            put(&cache, &test_key(2), &[2u8; 1000]);
            // Touch 1 so 2 becomes the eviction victim after reopen
            assert!(cache.get(&test_key(1)).is_some());
        }

        let cache = open_cache(temp.path(), 10_000_000);
        put(&cache, &test_key(3), &[3u8; 1000]);
        // Shrink pressure: reopen with a budget that only fits two entries
        drop(cache);
        let cache = open_cache(temp.path(), 2500);

        assert!(cache.get(&test_key(2)).is_none());
        assert!(cache.get(&test_key(1)).is_some());
        assert!(cache.get(&test_key(3)).is_some());
    }

    #[test]
    fn test_schema_change_invalidates_entries() {
        let temp = TempDir::new().unwrap();
        let key = test_key(1);

        {
            let cache = DiskCache::open(
                temp.path(),
                DiskCacheConfig::default().with_schema_version(1),
            )
            .unwrap();
            put(&cache, &key, b"old schema value");
        }

        let cache = DiskCache::open(
            temp.path(),
            DiskCacheConfig::default().with_schema_version(2),
        )
        .unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.get(&key).is_none());
        assert!(!temp.path().join(format!("{key}.0")).exists());
    }

    #[test]
    fn test_corrupt_journal_recovers_empty() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(JOURNAL_FILE), b"garbage\nnot a journal\n").unwrap();

        let cache = open_cache(temp.path(), 10_000_000);
        assert_eq!(cache.entry_count(), 0);

        // And it is usable afterwards
        put(&cache, &test_key(1), b"fresh start");
        assert_eq!(get_vec(&cache, &test_key(1)), Some(b"fresh start".to_vec()));
    }

    #[test]
    fn test_truncated_journal_tail_is_tolerated() {
        let temp = TempDir::new().unwrap();
        let key = test_key(1);

        {
            let cache = open_cache(temp.path(), 10_000_000);
            put(&cache, &key, b"whole value");
        }

        // Simulate a crash mid-append: chop the last few bytes off
        let journal_path = temp.path().join(JOURNAL_FILE);
        let mut bytes = fs::read(&journal_path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&journal_path, &bytes).unwrap();

        let cache = open_cache(temp.path(), 10_000_000);
        assert_eq!(get_vec(&cache, &key), Some(b"whole value".to_vec()));
    }

    #[test]
    fn test_missing_value_file_drops_entry() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        put(&cache, &key, b"about to vanish");
        fs::remove_file(temp.path().join(format!("{key}.0"))).unwrap();

        assert!(cache.get(&key).is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);

        put(&cache, &test_key(1), b"one");
        put(&cache, &test_key(2), b"two");

        cache.clear().unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size_bytes(), 0);
        assert!(cache.get(&test_key(1)).is_none());

        // Clear persists across reopen
        drop(cache);
        let cache = open_cache(temp.path(), 10_000_000);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_flush_succeeds() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        put(&cache, &test_key(1), b"flushed");
        cache.flush().unwrap();
    }

    #[test]
    fn test_read_handle_reports_size() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(temp.path(), 10_000_000);
        let key = test_key(1);

        put(&cache, &key, b"12345");
        let handle = cache.get(&key).unwrap();
        assert_eq!(handle.size_bytes(), 5);
    }

    #[test]
    fn test_concurrent_writers_different_keys() {
        use std::sync::Arc;

        let temp = TempDir::new().unwrap();
        let cache = Arc::new(open_cache(temp.path(), 10_000_000));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for n in 0..10 {
                    let key = test_key(t * 100 + n);
                    let mut w = cache.begin_write(&key).unwrap();
                    w.write_all(&[t as u8; 100]).unwrap();
                    w.commit().unwrap();
                    assert!(cache.get(&key).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.entry_count(), 40);
    }
}
