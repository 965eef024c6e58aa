//! Cache key derivation from resource locators.
//!
//! A cache key fingerprints the *locator* (URL), never the content and never
//! the requested display dimensions. Both cache tiers index by the same key.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use md5::{Digest, Md5};

/// A fixed-length cache key derived from a locator.
///
/// With the digest strategy this is a 32-character lowercase hex string;
/// the degraded strategy produces a decimal rendering instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key derivation strategy, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// MD5 digest of the locator bytes, rendered as lowercase hex.
    Digest,
    /// Decimal rendering of the locator's `DefaultHasher` value.
    ///
    /// Not collision-resistant and not guaranteed stable across toolchain
    /// upgrades. A degraded mode, never a silent equivalent.
    FallbackHash,
}

/// Derives cache keys from locators.
///
/// The strategy is probed once when the deriver is constructed; `derive`
/// itself is pure and deterministic for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    strategy: KeyStrategy,
}

/// Known-answer input/output pair used to verify the digest backend.
const PROBE_INPUT: &[u8] = b"";
const PROBE_DIGEST: &str = "d41d8cd98f00b204e9800998ecf8427e";

impl KeyDeriver {
    /// Create a deriver, probing the digest backend once.
    ///
    /// Falls back to [`KeyStrategy::FallbackHash`] (and logs a warning) if
    /// the backend does not produce the known answer.
    pub fn new() -> Self {
        let strategy = if hex_digest(PROBE_INPUT) == PROBE_DIGEST {
            KeyStrategy::Digest
        } else {
            tracing::warn!("digest backend failed probe, using degraded fallback hash keys");
            KeyStrategy::FallbackHash
        };
        Self { strategy }
    }

    /// Create a deriver with an explicit strategy.
    pub fn with_strategy(strategy: KeyStrategy) -> Self {
        Self { strategy }
    }

    /// The strategy selected at construction.
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Derive the cache key for a locator.
    pub fn derive(&self, locator: &str) -> CacheKey {
        match self.strategy {
            KeyStrategy::Digest => CacheKey(hex_digest(locator.as_bytes())),
            KeyStrategy::FallbackHash => {
                let mut hasher = DefaultHasher::new();
                locator.hash(&mut hasher);
                CacheKey(hasher.finish().to_string())
            }
        }
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconstruct a key recorded verbatim in the disk journal.
pub(crate) fn replayed_key(raw: &str) -> CacheKey {
    CacheKey(raw.to_string())
}

/// MD5 of `bytes` as lowercase hex, two digits per byte.
fn hex_digest(bytes: &[u8]) -> String {
    let mut digest = Md5::new();
    digest.update(bytes);
    digest
        .finalize()
        .iter()
        .fold(String::with_capacity(32), |mut out, byte| {
            use fmt::Write;
            let _ = write!(out, "{:02x}", byte);
            out
        })
}
