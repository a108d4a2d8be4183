//! Frame ingestion.
//!
//! `FrameSource` is the single entry point for frames. It runs in one of two
//! modes:
//! - **stream**: demultiplexes JPEGs from a continuous byte stream (a spawned
//!   camera process, stdin, or a recorded `.mjpeg` file)
//! - **capture**: calls a blocking single-shot `CaptureDevice` per frame
//!   (synthetic `stub://` devices, or V4L2 with feature `ingest-v4l2`)
//!
//! Both modes decode to RGB, resize to the configured shape and stamp frames
//! with consecutive indices. Transient failures (undecodable JPEG, failed
//! capture) are reported as `FrameOutcome::NoFrame` so the producer loop can
//! keep going.

mod capture;
pub mod mjpeg;
mod normalize;
pub mod process;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

use crate::frame::{Frame, FrameShape};

pub use capture::{CaptureDevice, SyntheticCapture};
pub use mjpeg::{decode_jpeg, MjpegDemuxer, MAX_BUFFERED_BYTES, READ_CHUNK_BYTES};
pub use process::{libcamera_command, ByteStream, CameraProcess};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Capture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Stream,
    Capture,
}

impl std::str::FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "capture" => Ok(Self::Capture),
            other => Err(anyhow!(
                "unknown source mode '{}'; expected stream or capture",
                other
            )),
        }
    }
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub mode: SourceMode,
    /// Stream mode: `-` for stdin, `file:///path` for a recorded stream,
    /// anything else spawns `command`.
    /// Capture mode: `stub://name` for a synthetic device, otherwise a V4L2
    /// device path.
    pub device: String,
    /// Camera program for stream mode. Empty means the default
    /// `libcamera-vid` invocation.
    pub command: Vec<String>,
    pub shape: FrameShape,
    pub fps: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Stream,
            device: "libcamera".to_string(),
            command: Vec::new(),
            shape: FrameShape::new(960, 540),
            fps: 30,
        }
    }
}

/// Result of one `FrameSource::next_frame` call.
#[derive(Debug)]
pub enum FrameOutcome {
    Frame(Frame),
    /// Transient failure; try again on the next tick.
    NoFrame,
    /// The source is exhausted.
    End,
}

/// Counters for a frame source.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub frames_produced: u64,
    pub decode_failures: u64,
    pub capture_failures: u64,
    pub buffer_resets: u64,
}

pub struct FrameSource {
    backend: SourceBackend,
    shape: FrameShape,
    fps: u32,
    next_index: u64,
    stats: SourceStats,
    last_frame_at: Option<Instant>,
    opened_at: Option<Instant>,
}

enum SourceBackend {
    Stream {
        demuxer: MjpegDemuxer<ByteStream>,
        process: Option<CameraProcess>,
    },
    Capture(Box<dyn CaptureDevice>),
    Closed,
}

impl FrameSource {
    /// Build and open the source described by `config`.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        match config.mode {
            SourceMode::Stream => Self::open_stream(config),
            SourceMode::Capture => {
                let device = open_capture_device(config)?;
                Self::from_capture(device, config.shape, config.fps)
            }
        }
    }

    /// Stream-mode source over an arbitrary reader.
    pub fn from_reader(reader: ByteStream, label: impl Into<String>, shape: FrameShape) -> Self {
        Self::new(
            SourceBackend::Stream {
                demuxer: MjpegDemuxer::new(reader),
                process: None,
            },
            label.into(),
            shape,
            0,
        )
    }

    /// Capture-mode source over `device`. Opens the device.
    pub fn from_capture(
        mut device: Box<dyn CaptureDevice>,
        shape: FrameShape,
        fps: u32,
    ) -> Result<Self> {
        device
            .open()
            .with_context(|| format!("open capture device {}", device.name()))?;
        let label = device.name().to_string();
        Ok(Self::new(SourceBackend::Capture(device), label, shape, fps))
    }

    fn open_stream(config: &SourceConfig) -> Result<Self> {
        if config.device == "-" {
            log::info!("FrameSource: reading MJPEG from stdin");
            return Ok(Self::from_reader(
                Box::new(std::io::stdin()),
                "stdin",
                config.shape,
            ));
        }
        if config.device.starts_with("file://") {
            let url = Url::parse(&config.device).context("parse stream file url")?;
            let path: PathBuf = url
                .to_file_path()
                .map_err(|_| anyhow!("invalid file url '{}'", config.device))?;
            let file = std::fs::File::open(&path)
                .with_context(|| format!("open recorded stream {}", path.display()))?;
            log::info!("FrameSource: reading MJPEG from {}", path.display());
            return Ok(Self::from_reader(
                Box::new(std::io::BufReader::new(file)),
                config.device.clone(),
                config.shape,
            ));
        }

        let command = if config.command.is_empty() {
            libcamera_command(config.shape, config.fps)
        } else {
            config.command.clone()
        };
        let (process, stdout) = CameraProcess::spawn(&command)?;
        Ok(Self::new(
            SourceBackend::Stream {
                demuxer: MjpegDemuxer::new(Box::new(stdout)),
                process: Some(process),
            },
            command[0].clone(),
            config.shape,
            config.fps,
        ))
    }

    fn new(backend: SourceBackend, label: String, shape: FrameShape, fps: u32) -> Self {
        Self {
            backend,
            shape,
            fps,
            next_index: 0,
            stats: SourceStats {
                source: label,
                ..SourceStats::default()
            },
            last_frame_at: None,
            opened_at: Some(Instant::now()),
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Produce the next frame.
    ///
    /// I/O errors on the underlying stream are returned as `Err` and are
    /// terminal for the source.
    pub fn next_frame(&mut self) -> Result<FrameOutcome> {
        let image = match &mut self.backend {
            SourceBackend::Stream { demuxer, .. } => {
                let jpeg = demuxer.next_jpeg();
                self.stats.buffer_resets = demuxer.resets();
                let Some(jpeg) = jpeg? else {
                    log::info!("FrameSource: {} reached end of stream", self.stats.source);
                    return Ok(FrameOutcome::End);
                };
                match decode_jpeg(&jpeg) {
                    Ok(image) => image,
                    Err(err) => {
                        self.stats.decode_failures += 1;
                        log::warn!(
                            "FrameSource: dropping undecodable frame ({} bytes): {:#}",
                            jpeg.len(),
                            err
                        );
                        return Ok(FrameOutcome::NoFrame);
                    }
                }
            }
            SourceBackend::Capture(device) => match device.capture() {
                Ok(image) => image,
                Err(err) => {
                    self.stats.capture_failures += 1;
                    log::warn!("FrameSource: capture from {} failed: {:#}", device.name(), err);
                    return Ok(FrameOutcome::NoFrame);
                }
            },
            SourceBackend::Closed => return Ok(FrameOutcome::End),
        };

        let image = normalize::fit_to_shape(image, self.shape);
        let frame = Frame::new(self.next_index, image);
        self.next_index += 1;
        self.stats.frames_produced += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(FrameOutcome::Frame(frame))
    }

    pub fn is_healthy(&mut self) -> bool {
        match &mut self.backend {
            SourceBackend::Stream {
                process: Some(process),
                ..
            } => {
                if !process.is_running() {
                    return false;
                }
            }
            SourceBackend::Capture(device) => {
                if !device.is_healthy() {
                    return false;
                }
            }
            SourceBackend::Stream { process: None, .. } => {}
            SourceBackend::Closed => return false,
        }
        let Some(opened_at) = self.opened_at else {
            return false;
        };
        match self.last_frame_at {
            Some(last) => last.elapsed() <= health_grace(self.fps),
            None => opened_at.elapsed() <= Duration::from_secs(5),
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    /// Release the underlying device or camera process.
    pub fn close(&mut self) -> Result<()> {
        let backend = std::mem::replace(&mut self.backend, SourceBackend::Closed);
        if let SourceBackend::Stream {
            process: Some(mut process),
            ..
        } = backend
        {
            process.terminate()?;
        }
        Ok(())
    }
}

fn open_capture_device(config: &SourceConfig) -> Result<Box<dyn CaptureDevice>> {
    if config.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticCapture::new(
            config.device.clone(),
            config.shape,
            config.fps,
        )));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Capture::new(
            config.device.clone(),
            config.shape,
            config.fps,
        )))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "capture device '{}' requires the ingest-v4l2 feature",
            config.device
        ))
    }
}

fn health_grace(fps: u32) -> Duration {
    let base_ms = if fps == 0 {
        2_000
    } else {
        (1000 / fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32, value: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([value, 0, 0]));
        let mut out = Vec::new();
        image
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, 90))
            .expect("encode test jpeg");
        out
    }

    #[test]
    fn stream_frames_are_indexed_and_resized() -> Result<()> {
        let stream = [jpeg(32, 18, 10), jpeg(64, 36, 20)].concat();
        let shape = FrameShape::new(16, 9);
        let mut source = FrameSource::from_reader(Box::new(Cursor::new(stream)), "test", shape);

        for expected in 0..2 {
            match source.next_frame()? {
                FrameOutcome::Frame(frame) => {
                    assert_eq!(frame.index, expected);
                    assert_eq!(frame.shape(), shape);
                }
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert!(matches!(source.next_frame()?, FrameOutcome::End));
        assert_eq!(source.stats().frames_produced, 2);
        Ok(())
    }

    #[test]
    fn undecodable_frame_yields_no_frame_and_continues() -> Result<()> {
        let mut stream = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        stream.extend_from_slice(&jpeg(8, 8, 99));
        let shape = FrameShape::new(8, 8);
        let mut source = FrameSource::from_reader(Box::new(Cursor::new(stream)), "test", shape);

        assert!(matches!(source.next_frame()?, FrameOutcome::NoFrame));
        match source.next_frame()? {
            FrameOutcome::Frame(frame) => assert_eq!(frame.index, 0),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(source.stats().decode_failures, 1);
        Ok(())
    }

    #[test]
    fn capture_mode_uses_synthetic_device() -> Result<()> {
        let config = SourceConfig {
            mode: SourceMode::Capture,
            device: "stub://bench".to_string(),
            shape: FrameShape::new(40, 30),
            fps: 0,
            ..SourceConfig::default()
        };
        let mut source = FrameSource::open(&config)?;
        assert!(matches!(source.next_frame()?, FrameOutcome::Frame(_)));
        assert!(source.is_healthy());
        source.close()?;
        assert!(matches!(source.next_frame()?, FrameOutcome::End));
        Ok(())
    }

    #[test]
    fn parses_source_mode() {
        assert_eq!("Stream".parse::<SourceMode>().unwrap(), SourceMode::Stream);
        assert_eq!("capture".parse::<SourceMode>().unwrap(), SourceMode::Capture);
        assert!("rtsp".parse::<SourceMode>().is_err());
    }
}
