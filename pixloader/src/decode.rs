//! Decode-and-downsample boundary.
//!
//! Turns raw encoded bytes into a [`Pixmap`] whose dimensions are bounded by
//! the requested maximums. Downsampling happens here, in memory, only; the
//! disk tier always stores the original encoded bytes.

use image::imageops::FilterType;
use thiserror::Error;

use crate::pixmap::Pixmap;

/// Decode failure: malformed or truncated input bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image decode failed: {0}")]
    Malformed(#[from] image::ImageError),
}

/// Decode `bytes` into a pixmap downsampled toward `max_width x max_height`.
///
/// Downsampling uses a power-of-two sample factor: dimensions are halved as
/// long as both remain at or above the bounds, so the result never drops
/// below the requested size. Passing `0` for either bound disables
/// downsampling entirely.
pub fn decode(bytes: &[u8], max_width: u32, max_height: u32) -> Result<Pixmap, DecodeError> {
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = (decoded.width(), decoded.height());

    let factor = sample_factor(width, height, max_width, max_height);
    let decoded = if factor > 1 {
        decoded.resize_exact(width / factor, height / factor, FilterType::Triangle)
    } else {
        decoded
    };

    let rgba = decoded.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    // Length is exact by construction of the RGBA8 buffer
    Ok(Pixmap::from_rgba8(width, height, rgba.into_raw())
        .expect("rgba8 buffer length mismatch"))
}

/// Largest power-of-two divisor keeping half-dimensions at or above the
/// requested bounds.
fn sample_factor(width: u32, height: u32, max_width: u32, max_height: u32) -> u32 {
    if max_width == 0 || max_height == 0 {
        return 1;
    }

    let mut factor = 1;
    if width > max_width || height > max_height {
        let half_width = width / 2;
        let half_height = height / 2;
        while half_width / factor >= max_width && half_height / factor >= max_height {
            factor *= 2;
        }
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn decode_without_bounds_keeps_dimensions() {
        let pixmap = decode(&png_bytes(64, 48), 0, 0).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (64, 48));
    }

    #[test]
    fn decode_downsamples_by_halving() {
        let pixmap = decode(&png_bytes(256, 256), 64, 64).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (64, 64));
    }

    #[test]
    fn decode_never_upscales() {
        let pixmap = decode(&png_bytes(32, 32), 512, 512).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (32, 32));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not an image at all", 0, 0).is_err());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut bytes = png_bytes(64, 64);
        bytes.truncate(bytes.len() / 2);
        assert!(decode(&bytes, 0, 0).is_err());
    }

    #[test]
    fn sample_factor_is_power_of_two() {
        assert_eq!(sample_factor(1024, 768, 0, 0), 1);
        assert_eq!(sample_factor(100, 100, 200, 200), 1);
        assert_eq!(sample_factor(256, 256, 64, 64), 4);
        assert_eq!(sample_factor(512, 512, 64, 64), 8);
        assert_eq!(sample_factor(1024, 1024, 64, 64), 16);
    }

    #[test]
    fn sample_factor_stops_at_the_tighter_dimension() {
        // Width reaches its bound first and caps the factor
        assert_eq!(sample_factor(256, 1024, 128, 128), 2);
    }
}
