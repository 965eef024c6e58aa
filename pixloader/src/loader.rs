//! Request orchestration: memory lookup, disk lookup, network fetch, and
//! delivery back to the consumer thread.
//!
//! A request walks the tiers in a fixed order: memory (synchronous fast
//! path), then on a worker thread disk, then network-into-disk, then — only
//! when the disk tier is disabled — a direct in-memory download. Every
//! asynchronous request posts exactly one [`LoaderResult`]; staleness is
//! resolved on the consumer thread with a per-slot generation counter.
//!
//! All I/O failures degrade to "no image" where they occur; nothing below
//! the loader propagates an error to the consumer.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheStats, DiskCache, MemoryCache};
use crate::config::LoaderConfig;
use crate::decode::decode;
use crate::dispatch::{delivery_channel, DeliveryReceiver, DeliverySender, WorkerPool};
use crate::fetch::{copy_stream, HttpClient, ReqwestClient, IO_BUF_SIZE};
use crate::key::{CacheKey, KeyDeriver};
use crate::pixmap::Pixmap;
use crate::platform::{CacheDirProvider, SystemDirProvider};

struct SlotInner {
    generation: AtomicU64,
    apply: Box<dyn Fn(&str, Arc<Pixmap>) + Send + Sync>,
}

/// A visual consumer slot: the thing a load is bound to.
///
/// Each slot carries a generation counter advanced by every [`Loader::bind`]
/// call. A delivered result is applied only if its generation still matches,
/// so a superseded request's late result is discarded rather than flashing
/// an outdated image.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl Slot {
    /// Create a slot whose `apply` callback receives fresh results.
    ///
    /// The callback runs on whichever thread performs delivery: the consumer
    /// thread for asynchronous loads, the caller's thread on the synchronous
    /// memory-hit fast path.
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&str, Arc<Pixmap>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SlotInner {
                generation: AtomicU64::new(0),
                apply: Box::new(apply),
            }),
        }
    }

    /// Advance to a new request generation, superseding earlier ones.
    pub(crate) fn advance(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The generation of the slot's most recent request.
    pub fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Whether `generation` is still the slot's latest request.
    pub fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn apply(&self, locator: &str, pixmap: Arc<Pixmap>) {
        (self.inner.apply)(locator, pixmap);
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("generation", &self.current_generation())
            .finish()
    }
}

/// Completed load posted from a worker task to the consumer thread.
pub struct LoaderResult {
    slot: Slot,
    generation: u64,
    locator: String,
    pixmap: Option<Arc<Pixmap>>,
}

impl LoaderResult {
    /// The locator this result was loaded for.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// The loaded pixmap, or `None` when the load failed.
    pub fn pixmap(&self) -> Option<&Arc<Pixmap>> {
        self.pixmap.as_ref()
    }

    /// Whether the slot has not requested anything newer since.
    pub fn is_current(&self) -> bool {
        self.slot.is_current(self.generation)
    }

    /// Apply the staleness check and commit the result to the slot.
    ///
    /// Returns `true` when the pixmap was applied; stale results are logged
    /// and dropped, failed loads leave the slot untouched.
    pub fn deliver(self) -> bool {
        if !self.is_current() {
            warn!(locator = %self.locator, "slot rebound since request, ignoring result");
            return false;
        }
        match self.pixmap {
            Some(pixmap) => {
                self.slot.apply(&self.locator, pixmap);
                true
            }
            None => {
                debug!(locator = %self.locator, "load produced no image");
                false
            }
        }
    }
}

struct LoaderInner {
    keys: KeyDeriver,
    memory: MemoryCache,
    disk: Option<DiskCache>,
    http: Arc<dyn HttpClient>,
    delivery: DeliverySender<LoaderResult>,
    consumer_thread: ThreadId,
    net_stats: Mutex<CacheStats>,
}

/// Orchestrates loads across the cache tiers and the network.
///
/// Construct one per application context, on the thread designated as the
/// consumer (UI) thread; the loader owns both caches and the worker pool
/// for its lifetime.
pub struct Loader {
    // Declared before `inner` so workers are joined while it is still alive
    pool: WorkerPool,
    inner: Arc<LoaderInner>,
    deliveries: Mutex<Option<DeliveryReceiver<LoaderResult>>>,
}

impl Loader {
    /// Build a loader with the system directory provider and the default
    /// HTTP client.
    pub fn build(config: LoaderConfig) -> Self {
        Self::with_parts(
            config,
            &SystemDirProvider::default(),
            Arc::new(ReqwestClient::default()),
        )
    }

    /// Build a loader with explicit collaborators.
    ///
    /// The disk tier is created only when `dir_provider` reports free space
    /// strictly greater than the configured disk budget; otherwise this
    /// instance runs memory-cache plus direct download for its lifetime.
    pub fn with_parts(
        config: LoaderConfig,
        dir_provider: &dyn CacheDirProvider,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let directory = dir_provider.cache_dir();
        if let Err(err) = std::fs::create_dir_all(&directory) {
            warn!(directory = %directory.display(), error = %err, "cannot create cache directory");
        }

        let disk = open_disk_tier(&config, dir_provider, &directory);
        let (delivery_tx, delivery_rx) = delivery_channel();

        Self {
            pool: WorkerPool::new(config.pool),
            inner: Arc::new(LoaderInner {
                keys: KeyDeriver::new(),
                memory: MemoryCache::new(config.memory.budget_kb),
                disk,
                http,
                delivery: delivery_tx,
                consumer_thread: thread::current().id(),
                net_stats: Mutex::new(CacheStats::new()),
            }),
            deliveries: Mutex::new(Some(delivery_rx)),
        }
    }

    /// Fire-and-forget load: fetch `locator` and deliver it to `slot`.
    ///
    /// Should be called on the consumer thread.
    pub fn bind(&self, locator: &str, slot: &Slot) {
        self.bind_sized(locator, slot, 0, 0);
    }

    /// [`bind`](Self::bind) with target dimensions for decode downsampling.
    pub fn bind_sized(&self, locator: &str, slot: &Slot, max_width: u32, max_height: u32) {
        let generation = slot.advance();
        let key = self.inner.keys.derive(locator);

        // Fast path: memory hit delivers synchronously on this thread
        if let Some(pixmap) = self.inner.memory.get(&key) {
            LoaderResult {
                slot: slot.clone(),
                generation,
                locator: locator.to_string(),
                pixmap: Some(pixmap),
            }
            .deliver();
            return;
        }

        let inner = Arc::clone(&self.inner);
        let slot = slot.clone();
        let locator = locator.to_string();
        self.pool.execute(move || {
            let pixmap = inner.load(&locator, max_width, max_height);
            let posted = inner.delivery.post(LoaderResult {
                slot,
                generation,
                locator,
                pixmap,
            });
            if !posted {
                debug!("consumer side gone, dropping load result");
            }
        });
    }

    /// Synchronous load through the full pipeline.
    ///
    /// Usable off the consumer thread (e.g. batch pre-processing); the
    /// network step panics when reached from the consumer thread.
    pub fn load_pixmap(&self, locator: &str, max_width: u32, max_height: u32) -> Option<Arc<Pixmap>> {
        self.inner.load(locator, max_width, max_height)
    }

    /// Take the delivery stream. Yields `Some` exactly once.
    pub fn take_deliveries(&self) -> Option<Deliveries> {
        self.deliveries
            .lock()
            .unwrap()
            .take()
            .map(|rx| Deliveries { rx })
    }

    /// Whether the disk tier was created at construction time.
    pub fn disk_enabled(&self) -> bool {
        self.inner.disk.is_some()
    }

    /// Merged statistics across both tiers and the network.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.memory.stats();
        if let Some(disk) = &self.inner.disk {
            let disk_stats = disk.stats();
            stats.disk_hits = disk_stats.disk_hits;
            stats.disk_misses = disk_stats.disk_misses;
            stats.disk_size_bytes = disk_stats.disk_size_bytes;
            stats.disk_entry_count = disk_stats.disk_entry_count;
            stats.disk_evictions = disk_stats.disk_evictions;
            stats.disk_writes = disk_stats.disk_writes;
            stats.disk_write_failures = disk_stats.disk_write_failures;
        }
        let net = self.inner.net_stats.lock().unwrap();
        stats.downloads = net.downloads;
        stats.download_failures = net.download_failures;
        stats.bytes_downloaded = net.bytes_downloaded;
        stats
    }
}

/// Create the disk tier if the volume has room for it.
fn open_disk_tier(
    config: &LoaderConfig,
    dir_provider: &dyn CacheDirProvider,
    directory: &Path,
) -> Option<DiskCache> {
    let free = dir_provider.available_space(directory);
    if free <= config.disk.budget_bytes {
        info!(
            free_bytes = free,
            budget_bytes = config.disk.budget_bytes,
            "insufficient free space, disk cache disabled"
        );
        return None;
    }
    match DiskCache::open(directory, config.disk.clone()) {
        Ok(disk) => Some(disk),
        Err(err) => {
            warn!(error = %err, "failed to open disk cache, running without it");
            None
        }
    }
}

impl LoaderInner {
    /// The full miss pipeline: memory, disk, network-into-disk, and — with
    /// no disk tier — direct download.
    fn load(&self, locator: &str, max_width: u32, max_height: u32) -> Option<Arc<Pixmap>> {
        let key = self.keys.derive(locator);

        if let Some(pixmap) = self.memory.get(&key) {
            debug!(locator, "loaded from memory cache");
            return Some(pixmap);
        }

        if let Some(pixmap) = self.load_from_disk(&key, max_width, max_height) {
            debug!(locator, "loaded from disk cache");
            return Some(pixmap);
        }

        if let Some(pixmap) = self.download_through_disk(locator, &key, max_width, max_height) {
            debug!(locator, "downloaded into disk cache");
            return Some(pixmap);
        }

        if self.disk.is_none() {
            warn!(locator, "disk cache unavailable, downloading directly");
            return self.download_direct(locator, &key, max_width, max_height);
        }

        None
    }

    /// Decode the committed disk bytes and promote them to the memory tier.
    fn load_from_disk(&self, key: &CacheKey, max_width: u32, max_height: u32) -> Option<Arc<Pixmap>> {
        if thread::current().id() == self.consumer_thread {
            warn!("disk cache read on the consumer thread, expect jank");
        }
        let disk = self.disk.as_ref()?;
        let handle = disk.get(key)?;

        let bytes = match handle.read_to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to read cached value");
                return None;
            }
        };
        match decode(&bytes, max_width, max_height) {
            Ok(pixmap) => {
                let pixmap = Arc::new(pixmap);
                self.memory.put(key.clone(), Arc::clone(&pixmap));
                Some(pixmap)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cached bytes failed to decode");
                None
            }
        }
    }

    /// Stream the locator's bytes into the disk cache, then re-read them
    /// through the disk path so decode always sees the same storage format.
    fn download_through_disk(
        &self,
        locator: &str,
        key: &CacheKey,
        max_width: u32,
        max_height: u32,
    ) -> Option<Arc<Pixmap>> {
        let disk = self.disk.as_ref()?;
        self.assert_off_consumer_thread();

        // A second writer for the key is already in flight: skip the
        // download and fall through to whatever it commits.
        if let Some(mut handle) = disk.begin_write(key) {
            match self.http.open(locator) {
                Ok(stream) => {
                    if copy_stream(stream, &mut handle, IO_BUF_SIZE) {
                        let bytes_written = handle.bytes_written();
                        match handle.commit() {
                            Ok(()) => {
                                self.net_stats.lock().unwrap().record_download(bytes_written);
                            }
                            Err(err) => {
                                warn!(locator, error = %err, "failed to commit downloaded bytes");
                                self.net_stats.lock().unwrap().record_download_failure();
                            }
                        }
                    } else {
                        warn!(locator, "download interrupted, aborting cache write");
                        handle.abort();
                        self.net_stats.lock().unwrap().record_download_failure();
                    }
                }
                Err(err) => {
                    warn!(locator, error = %err, "fetch failed");
                    handle.abort();
                    self.net_stats.lock().unwrap().record_download_failure();
                }
            }
            if let Err(err) = disk.flush() {
                warn!(error = %err, "disk cache flush failed");
            }
        }

        self.load_from_disk(key, max_width, max_height)
    }

    /// Fetch into an in-memory sink and decode, bypassing disk entirely.
    ///
    /// The sole fallback when no disk cache exists.
    fn download_direct(
        &self,
        locator: &str,
        key: &CacheKey,
        max_width: u32,
        max_height: u32,
    ) -> Option<Arc<Pixmap>> {
        self.assert_off_consumer_thread();

        let stream = match self.http.open(locator) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(locator, error = %err, "fetch failed");
                self.net_stats.lock().unwrap().record_download_failure();
                return None;
            }
        };

        let mut sink: Vec<u8> = Vec::new();
        if !copy_stream(stream, &mut sink, IO_BUF_SIZE) {
            self.net_stats.lock().unwrap().record_download_failure();
            return None;
        }
        self.net_stats
            .lock()
            .unwrap()
            .record_download(sink.len() as u64);

        match decode(&sink, max_width, max_height) {
            Ok(pixmap) => {
                let pixmap = Arc::new(pixmap);
                self.memory.put(key.clone(), Arc::clone(&pixmap));
                Some(pixmap)
            }
            Err(err) => {
                warn!(locator, error = %err, "downloaded bytes failed to decode");
                None
            }
        }
    }

    fn assert_off_consumer_thread(&self) {
        assert!(
            thread::current().id() != self.consumer_thread,
            "network fetch invoked on the consumer thread; use bind() to run it on the pool"
        );
    }
}

/// The consumer-thread end of the delivery channel.
pub struct Deliveries {
    rx: DeliveryReceiver<LoaderResult>,
}

impl Deliveries {
    /// Block for the next result without delivering it.
    pub fn recv(&self) -> Option<LoaderResult> {
        self.rx.recv()
    }

    /// Block up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LoaderResult> {
        self.rx.recv_timeout(timeout)
    }

    /// Deliver everything that has already arrived; returns how many
    /// results were applied (stale and failed ones count as not applied).
    pub fn poll(&self) -> usize {
        self.rx.try_iter().map(|r| r.deliver() as usize).sum()
    }

    /// Deliver results until the loader is dropped.
    ///
    /// Run this on the thread designated as the consumer thread.
    pub fn run(self) {
        while let Some(result) = self.rx.recv() {
            result.deliver();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ByteStream, FetchError};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct StaticClient {
        body: Vec<u8>,
        calls: AtomicUsize,
    }

    impl HttpClient for StaticClient {
        fn open(&self, _locator: &str) -> Result<ByteStream, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(std::io::Cursor::new(self.body.clone())))
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn recording_slot() -> (Slot, Arc<Mutex<Vec<String>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let slot = Slot::new(move |locator, _pixmap| {
            sink.lock().unwrap().push(locator.to_string());
        });
        (slot, applied)
    }

    #[test]
    fn slot_generations_advance() {
        let (slot, _) = recording_slot();
        assert_eq!(slot.current_generation(), 0);
        assert_eq!(slot.advance(), 1);
        assert_eq!(slot.advance(), 2);
        assert!(slot.is_current(2));
        assert!(!slot.is_current(1));
    }

    #[test]
    fn stale_result_is_dropped() {
        let (slot, applied) = recording_slot();
        let generation = slot.advance();
        slot.advance(); // a newer request supersedes it

        let pixmap = Arc::new(Pixmap::from_rgba8(1, 1, vec![0; 4]).unwrap());
        let result = LoaderResult {
            slot,
            generation,
            locator: "http://example.com/old.png".into(),
            pixmap: Some(pixmap),
        };

        assert!(!result.deliver());
        assert!(applied.lock().unwrap().is_empty());
    }

    #[test]
    fn current_result_is_applied() {
        let (slot, applied) = recording_slot();
        let generation = slot.advance();

        let pixmap = Arc::new(Pixmap::from_rgba8(1, 1, vec![0; 4]).unwrap());
        let result = LoaderResult {
            slot,
            generation,
            locator: "http://example.com/a.png".into(),
            pixmap: Some(pixmap),
        };

        assert!(result.deliver());
        assert_eq!(*applied.lock().unwrap(), vec!["http://example.com/a.png"]);
    }

    #[test]
    fn failed_result_leaves_slot_untouched() {
        let (slot, applied) = recording_slot();
        let generation = slot.advance();

        let result = LoaderResult {
            slot,
            generation,
            locator: "http://example.com/broken.png".into(),
            pixmap: None,
        };

        assert!(!result.deliver());
        assert!(applied.lock().unwrap().is_empty());
    }

    #[test]
    fn disk_tier_disabled_without_free_space() {
        let temp = TempDir::new().unwrap();
        let provider = crate::platform::FixedDirProvider::new(temp.path(), 0);
        let loader = Loader::with_parts(
            LoaderConfig::new(),
            &provider,
            Arc::new(StaticClient {
                body: png_bytes(),
                calls: AtomicUsize::new(0),
            }),
        );
        assert!(!loader.disk_enabled());
    }

    #[test]
    fn disk_tier_enabled_with_free_space() {
        let temp = TempDir::new().unwrap();
        let provider = crate::platform::FixedDirProvider::new(temp.path(), u64::MAX);
        let loader = Loader::with_parts(
            LoaderConfig::new(),
            &provider,
            Arc::new(StaticClient {
                body: png_bytes(),
                calls: AtomicUsize::new(0),
            }),
        );
        assert!(loader.disk_enabled());
    }

    #[test]
    fn take_deliveries_yields_once() {
        let temp = TempDir::new().unwrap();
        let provider = crate::platform::FixedDirProvider::new(temp.path(), 0);
        let loader = Loader::with_parts(
            LoaderConfig::new(),
            &provider,
            Arc::new(StaticClient {
                body: Vec::new(),
                calls: AtomicUsize::new(0),
            }),
        );
        assert!(loader.take_deliveries().is_some());
        assert!(loader.take_deliveries().is_none());
    }

    #[test]
    #[should_panic(expected = "consumer thread")]
    fn network_fetch_on_consumer_thread_panics() {
        let temp = TempDir::new().unwrap();
        let provider = crate::platform::FixedDirProvider::new(temp.path(), 0);
        let loader = Loader::with_parts(
            LoaderConfig::new(),
            &provider,
            Arc::new(StaticClient {
                body: png_bytes(),
                calls: AtomicUsize::new(0),
            }),
        );
        // Built on this thread, so this thread is the consumer thread and
        // the direct-download step must refuse to run on it.
        loader.load_pixmap("http://example.com/a.png", 0, 0);
    }
}
