//! Decoded pixel buffer type shared between the cache tiers.

use std::fmt;

/// A decoded image: tightly-packed RGBA8 pixels.
///
/// Pixmaps are immutable after decode and shared by reference
/// (`Arc<Pixmap>`) between the memory cache and in-flight requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Pixmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Pixmap {
    /// Create a pixmap from raw RGBA8 bytes.
    ///
    /// Returns `None` if `data` is not exactly `width * height * 4` bytes.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row (RGBA8: four bytes per pixel, no padding).
    pub fn row_bytes(&self) -> usize {
        self.width as usize * 4
    }

    /// Total byte footprint of the pixel data.
    pub fn byte_size(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Cache weight in KiB (`row_bytes * height / 1024`).
    pub fn weight_kb(&self) -> usize {
        self.byte_size() / 1024
    }

    /// Raw RGBA8 pixel data, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pixmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
