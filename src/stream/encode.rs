use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::ops::Range;

/// Multipart boundary used by the stream.
pub const BOUNDARY: &str = "frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encode `image` as a baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))
        .context("encode jpeg")?;
    Ok(out)
}

/// One part of a `multipart/x-mixed-replace` stream.
#[derive(Clone, Debug)]
pub struct StreamChunk {
    pub frame_index: u64,
    bytes: Vec<u8>,
    jpeg: Range<usize>,
}

impl StreamChunk {
    /// Wrap an encoded JPEG in its part header and trailing CRLF.
    pub fn new(frame_index: u64, jpeg: &[u8]) -> Self {
        let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
        let mut bytes = Vec::with_capacity(header.len() + jpeg.len() + 2);
        bytes.extend_from_slice(header.as_bytes());
        let start = bytes.len();
        bytes.extend_from_slice(jpeg);
        let end = bytes.len();
        bytes.extend_from_slice(b"\r\n");
        Self {
            frame_index,
            bytes,
            jpeg: start..end,
        }
    }

    /// The full part, ready to write to a client.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The JPEG payload alone.
    pub fn jpeg(&self) -> &[u8] {
        &self.bytes[self.jpeg.clone()]
    }
}

/// Re-encodes annotated frames as stream parts.
#[derive(Clone, Debug)]
pub struct StreamEncoder {
    quality: u8,
}

impl StreamEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    pub fn encode(&self, frame_index: u64, image: &RgbImage) -> Result<StreamChunk> {
        let jpeg = encode_jpeg(image, self.quality)?;
        Ok(StreamChunk::new(frame_index, &jpeg))
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}
