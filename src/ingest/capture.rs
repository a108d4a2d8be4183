//! Single-shot capture devices.
//!
//! A `CaptureDevice` returns one decoded RGB image per blocking call. It is
//! the capture-mode counterpart of the byte-stream demuxer.

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use crate::frame::FrameShape;

/// Blocking single-frame capture primitive.
pub trait CaptureDevice: Send {
    /// Device identifier used in logs and stats.
    fn name(&self) -> &str;

    /// Open the device. Called once before the first capture.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Capture one frame. The image may be any size; the caller resizes.
    fn capture(&mut self) -> Result<RgbImage>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Synthetic device for `stub://` identities.
///
/// Renders a gradient background with a bright square that moves a few
/// pixels per frame, paced to the configured frame rate.
pub struct SyntheticCapture {
    name: String,
    shape: FrameShape,
    interval: Duration,
    last_capture: Option<Instant>,
    frame_count: u64,
}

impl SyntheticCapture {
    pub fn new(name: impl Into<String>, shape: FrameShape, fps: u32) -> Self {
        Self {
            name: name.into(),
            shape,
            interval: frame_interval(fps),
            last_capture: None,
            frame_count: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let FrameShape { width, height } = self.shape;
        let side = (width.min(height) / 6).max(1);
        let travel = width.saturating_sub(side).max(1);
        let left = ((self.frame_count * 4) % travel as u64) as u32;
        let top = height.saturating_sub(side) / 2;

        RgbImage::from_fn(width, height, |x, y| {
            if x >= left && x < left + side && y >= top && y < top + side {
                Rgb([240, 240, 32])
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let b = (y * 255 / height.max(1)) as u8;
                Rgb([r, 64, b])
            }
        })
    }
}

impl CaptureDevice for SyntheticCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        log::info!("SyntheticCapture: opened {} (synthetic)", self.name);
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbImage> {
        if let Some(last) = self.last_capture {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());
        let image = self.render();
        self.frame_count += 1;
        Ok(image)
    }
}

pub(crate) fn frame_interval(fps: u32) -> Duration {
    if fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / fps).max(1) as u64)
    }
}
