//! Marker-delimited JPEG extraction from a raw MJPEG byte stream.
//!
//! Framing is recovered purely from the JPEG start-of-image (`FF D8`) and
//! end-of-image (`FF D9`) markers. Multipart boundaries, `Content-Length`
//! headers and any other framing in the body are ignored.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Cap on bytes held while waiting for an end marker.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Accumulates stream chunks and yields complete JPEG slices.
pub struct MjpegParser {
    buffer: Vec<u8>,
    max_buffer: usize,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFER_BYTES)
    }

    pub fn with_limit(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            max_buffer: max_buffer.max(4),
        }
    }

    /// Append a chunk and return every complete JPEG slice it completes, in order.
    ///
    /// Bytes before a start marker are discarded along with each consumed frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
            frames.push(self.buffer[start..end].to_vec());
            self.buffer.drain(..end);
        }
        self.compact();
        frames
    }

    /// Bytes currently held waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn compact(&mut self) {
        match find_marker(&self.buffer, SOI, 0) {
            Some(0) => {}
            Some(start) => {
                self.buffer.drain(..start);
            }
            None => {
                // A trailing 0xFF may be the first half of a split start marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop_len = self.buffer.len() - keep;
                self.buffer.drain(..drop_len);
            }
        }

        if self.buffer.len() > self.max_buffer {
            // Keep the newest partial frame; it may still complete.
            match rfind_marker(&self.buffer, SOI) {
                Some(last) if last > 0 && self.buffer.len() - last <= self.max_buffer => {
                    log::warn!(
                        "mjpeg buffer exceeded {} bytes; dropping {} bytes before the last start marker",
                        self.max_buffer,
                        last
                    );
                    self.buffer.drain(..last);
                }
                _ => {
                    log::warn!(
                        "mjpeg buffer exceeded {} bytes without an end marker; discarding",
                        self.max_buffer
                    );
                    self.buffer.clear();
                }
            }
        }
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the first start marker and the first end marker after it.
///
/// Returns the half-open byte range `[start, end)` including both markers.
pub(crate) fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find_marker(buffer, SOI, 0)?;
    let end = find_marker(buffer, EOI, start + 2)?;
    Some((start, end + 2))
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if from >= buffer.len() {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

fn rfind_marker(buffer: &[u8], marker: [u8; 2]) -> Option<usize> {
    buffer.windows(2).rposition(|w| w == marker)
}

/// Decode a JPEG slice into packed RGB8 pixels.
pub fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("decoded jpeg has zero dimension"));
    }
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

/// Encode packed RGB8 pixels as a baseline JPEG.
pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "RGB frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(pixels, width, height, image::ExtendedColorType::Rgb8)
        .context("encode jpeg")?;
    Ok(out)
}
