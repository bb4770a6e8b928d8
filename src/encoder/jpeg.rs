use bytes::Bytes;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use std::time::Duration;

use crate::error::StreamError;
use crate::pipeline::types::clamp_quality;

/// Encode cost per megapixel, measured on a slow laptop core with headroom
const MICROS_PER_MEGAPIXEL: u64 = 30_000;
/// Fixed per-frame overhead
const BASE_MICROS: u64 = 2_000;

/// Compress an RGB image at `quality` (clamped to 1-100)
pub fn encode(image: &RgbImage, quality: u8) -> Result<Bytes, StreamError> {
    let quality = clamp_quality(quality as i32);
    let (w, h) = image.dimensions();
    // Half a byte per pixel covers typical desktop content
    let mut out = Vec::with_capacity((w as usize * h as usize / 2).max(1024));

    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .map_err(|e| StreamError::EncodeFailed {
            width: w,
            height: h,
            reason: format!("jpeg: {}", e),
        })?;
    Ok(Bytes::from(out))
}

/// Worst-case encode time for a frame of the given size
pub fn max_encode_latency(width: u32, height: u32) -> Duration {
    let pixels = width as u64 * height as u64;
    Duration::from_micros(BASE_MICROS + pixels * MICROS_PER_MEGAPIXEL / 1_000_000)
}
