//! Cache directory selection and free-space probing.
//!
//! The loader only needs two things from the platform: a writable directory
//! path and a free-space query in bytes. Both are behind a trait so tests
//! and embedders can substitute their own.

use std::path::{Path, PathBuf};

/// Provides the disk cache's backing directory and its free space.
pub trait CacheDirProvider: Send + Sync {
    /// Directory the disk cache should live in. Not required to exist yet.
    fn cache_dir(&self) -> PathBuf;

    /// Free space in bytes on the volume holding `path`.
    fn available_space(&self, path: &Path) -> u64;
}

/// System provider: the user cache directory plus a mount-table probe.
pub struct SystemDirProvider {
    subdir: String,
}

impl SystemDirProvider {
    /// Create a provider rooted at `<user cache dir>/<subdir>`.
    pub fn new(subdir: impl Into<String>) -> Self {
        Self {
            subdir: subdir.into(),
        }
    }
}

impl Default for SystemDirProvider {
    fn default() -> Self {
        Self::new("pixloader")
    }
}

impl CacheDirProvider for SystemDirProvider {
    fn cache_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&self.subdir)
    }

    fn available_space(&self, path: &Path) -> u64 {
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // Longest mount-point prefix wins
        let mut best: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map(|(d, _)| depth > d).unwrap_or(true) {
                    best = Some((depth, disk.available_space()));
                }
            }
        }

        match best {
            Some((_, space)) => space,
            None => {
                tracing::warn!(path = %path.display(), "no mount point found for cache path");
                0
            }
        }
    }
}

/// Fixed provider for tests and explicit overrides.
pub struct FixedDirProvider {
    dir: PathBuf,
    free_bytes: u64,
}

impl FixedDirProvider {
    pub fn new(dir: impl Into<PathBuf>, free_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            free_bytes,
        }
    }
}

impl CacheDirProvider for FixedDirProvider {
    fn cache_dir(&self) -> PathBuf {
        self.dir.clone()
    }

    fn available_space(&self, _path: &Path) -> u64 {
        self.free_bytes
    }
}
