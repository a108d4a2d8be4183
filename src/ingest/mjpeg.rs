//! Byte-stream JPEG demultiplexer.
//!
//! Camera processes such as `libcamera-vid --codec mjpeg -o -` write a bare
//! concatenation of JPEG images to stdout with no container framing. The
//! demuxer accumulates fixed-size reads and splits on the JPEG end-of-image
//! marker (`FF D9`). Bytes after the marker stay buffered as the start of the
//! next frame.
//!
//! If the buffer grows past `MAX_BUFFERED_BYTES` without a marker the stream
//! is assumed desynchronised and the buffer is discarded.

use anyhow::{Context, Result};
use image::RgbImage;
use std::io::Read;

/// Bytes requested from the reader per read call.
pub const READ_CHUNK_BYTES: usize = 1024;
/// Buffer ceiling before an unterminated frame is discarded.
pub const MAX_BUFFERED_BYTES: usize = 1_000_000;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Splits a raw byte stream into complete JPEG images.
pub struct MjpegDemuxer<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    /// Offset from which the next marker scan starts.
    scanned: usize,
    resets: u64,
}

impl<R: Read> MjpegDemuxer<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, READ_CHUNK_BYTES)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; chunk_size.max(1)],
            scanned: 0,
            resets: 0,
        }
    }

    /// Read until one complete JPEG is available.
    ///
    /// Returns `Ok(None)` once the reader is exhausted. A trailing partial
    /// frame at end of stream is dropped.
    pub fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(jpeg) = self.take_frame() {
                return Ok(Some(jpeg));
            }

            let read = self
                .reader
                .read(&mut self.chunk)
                .context("read camera byte stream")?;
            if read == 0 {
                if !self.buffer.is_empty() {
                    log::debug!(
                        "MjpegDemuxer: dropping {} trailing bytes at end of stream",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&self.chunk[..read]);

            if self.buffer.len() > MAX_BUFFERED_BYTES
                && find_marker(&self.buffer, EOI, self.scanned).is_none()
            {
                log::warn!(
                    "MjpegDemuxer: {} bytes without end-of-image marker; resetting buffer",
                    self.buffer.len()
                );
                self.buffer.clear();
                self.scanned = 0;
                self.resets += 1;
            }
        }
    }

    /// Number of times the buffer was discarded for exceeding the ceiling.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Bytes currently held waiting for a marker.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let Some(marker) = find_marker(&self.buffer, EOI, self.scanned) else {
            // A marker may straddle the next read.
            self.scanned = self.buffer.len().saturating_sub(1);
            return None;
        };
        let end = marker + EOI.len();
        let start = find_marker(&self.buffer[..end], SOI, 0).unwrap_or(0);
        if start > 0 {
            log::debug!("MjpegDemuxer: skipping {} bytes before start-of-image", start);
        }
        let jpeg = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        self.scanned = 0;
        Some(jpeg)
    }
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

/// Decode one JPEG image into RGB.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}
