//! V4L2 capture device.
//!
//! Opens a local device node (e.g. `/dev/video0`), negotiates a YUYV or RGB3
//! format near the configured resolution, and returns one RGB image per
//! `capture` call from a memory-mapped buffer stream.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::capture::CaptureDevice;
use super::normalize::{normalize_to_rgb, PixelFormat};
use crate::frame::FrameShape;

pub struct V4l2Capture {
    device_path: String,
    shape: FrameShape,
    fps: u32,
    state: Option<V4l2State>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Capture {
    pub fn new(device_path: impl Into<String>, shape: FrameShape, fps: u32) -> Self {
        Self {
            device_path: device_path.into(),
            shape,
            fps,
            state: None,
            format: PixelFormat::Yuyv,
            active_width: shape.width,
            active_height: shape.height,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.fps == 0 {
            2_000
        } else {
            (1000 / self.fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl CaptureDevice for V4l2Capture {
    fn name(&self) -> &str {
        &self.device_path
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.shape.width;
        format.height = self.shape.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Capture: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"YUYV" => PixelFormat::Yuyv,
            b"RGB3" => PixelFormat::Rgb24,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} negotiated unsupported pixel format {}",
                    self.device_path,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Capture: failed to set fps on {}: {}",
                    self.device_path,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Capture: opened {} ({}x{} {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbImage> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not opened")?;
        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let image = state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))
                    .and_then(|(buf, _meta)| normalize_to_rgb(buf, width, height, format))
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                err
            })?;

        self.last_error = None;
        self.last_frame_at = Some(Instant::now());
        Ok(image)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }
}
