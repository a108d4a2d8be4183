use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::ModelInput;
use crate::frame::{FrameShape, RGB_CHANNELS};
use crate::ingest::{SourceConfig, SourceMode};
use crate::pipeline::{PipelineConfig, UploadPolicy, UploadTrigger, DEFAULT_INGESTION_URL};
use crate::server::ServerConfig;
use crate::stream::DEFAULT_JPEG_QUALITY;

const DEFAULT_DEVICE: &str = "libcamera";
const DEFAULT_WIDTH: u32 = 960;
const DEFAULT_HEIGHT: u32 = 540;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_SKIP_FACTOR: u32 = 8;
const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_STICKINESS: u32 = 20;
const DEFAULT_MODEL: &str = "stub://";
const DEFAULT_MODEL_INPUT: u32 = 320;
const DEFAULT_DISPLAY_THRESHOLD: f32 = 0.0;
const DEFAULT_UPLOAD_THRESHOLD: f32 = 1.0;
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamerConfigFile {
    camera: Option<CameraConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    model: Option<ModelConfigFile>,
    overlay: Option<OverlayConfigFile>,
    upload: Option<UploadConfigFile>,
    server: Option<ServerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    mode: Option<SourceMode>,
    device: Option<String>,
    command: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    skip_factor: Option<u32>,
    queue_capacity: Option<usize>,
    stickiness: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    display_threshold: Option<f32>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    enabled: Option<bool>,
    threshold: Option<f32>,
    trigger: Option<UploadTrigger>,
    url: Option<String>,
    api_key: Option<String>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub source: SourceConfig,
    pub channels: u32,
    pub pipeline: PipelineConfig,
    pub model: ModelSettings,
    pub overlay: OverlaySettings,
    pub upload: UploadSettings,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// `stub://...` or a path to an `.eim` model.
    pub identity: String,
    /// Input geometry for engines that do not report their own.
    pub input: ModelInput,
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub display_threshold: f32,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub url: String,
    pub api_key: Option<String>,
    /// Version string attached to uploads. Defaults to the model's own.
    pub model_version: Option<String>,
}

impl StreamerConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load `path` (or defaults), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamerConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let overlay = file.overlay.unwrap_or_default();
        let upload = file.upload.unwrap_or_default();
        let server = file.server.unwrap_or_default();

        let shape = FrameShape::new(
            camera.width.unwrap_or(DEFAULT_WIDTH),
            camera.height.unwrap_or(DEFAULT_HEIGHT),
        );
        let source = SourceConfig {
            mode: camera.mode.unwrap_or(SourceMode::Stream),
            device: camera.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            command: camera.command.unwrap_or_default(),
            shape,
            fps: camera.fps.unwrap_or(DEFAULT_FPS),
        };
        let policy = UploadPolicy {
            enabled: upload.enabled.unwrap_or(false),
            threshold: upload.threshold.unwrap_or(DEFAULT_UPLOAD_THRESHOLD),
            trigger: upload.trigger.unwrap_or(UploadTrigger::AtOrBelow),
        };
        Self {
            source,
            channels: camera.channels.unwrap_or(RGB_CHANNELS),
            pipeline: PipelineConfig {
                shape,
                skip_factor: pipeline.skip_factor.unwrap_or(DEFAULT_SKIP_FACTOR),
                queue_capacity: pipeline.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                stickiness: pipeline.stickiness.unwrap_or(DEFAULT_STICKINESS),
                upload: policy,
                jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            model: ModelSettings {
                identity: model.path.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                input: ModelInput::rgb(
                    model.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                    model.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                ),
            },
            overlay: OverlaySettings {
                display_threshold: overlay
                    .display_threshold
                    .unwrap_or(DEFAULT_DISPLAY_THRESHOLD),
                font_path: overlay.font_path,
            },
            upload: UploadSettings {
                url: upload.url.unwrap_or_else(|| DEFAULT_INGESTION_URL.to_string()),
                api_key: upload.api_key,
                model_version: upload.model_version,
            },
            server: ServerConfig {
                addr: server.addr.unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(mode) = env_value("STREAMER_SOURCE_MODE") {
            self.source.mode = mode.parse()?;
        }
        if let Some(device) = env_value("STREAMER_SOURCE_DEVICE") {
            self.source.device = device;
        }
        if let Some(width) = env_parse::<u32>("STREAMER_WIDTH")? {
            self.set_shape(FrameShape::new(width, self.pipeline.shape.height));
        }
        if let Some(height) = env_parse::<u32>("STREAMER_HEIGHT")? {
            self.set_shape(FrameShape::new(self.pipeline.shape.width, height));
        }
        if let Some(fps) = env_parse("STREAMER_FPS")? {
            self.source.fps = fps;
        }
        if let Some(skip) = env_parse("STREAMER_SKIP_FACTOR")? {
            self.pipeline.skip_factor = skip;
        }
        if let Some(stickiness) = env_parse("STREAMER_STICKINESS")? {
            self.pipeline.stickiness = stickiness;
        }
        if let Some(model) = env_value("STREAMER_MODEL") {
            self.model.identity = model;
        }
        if let Some(addr) = env_value("STREAMER_BIND_ADDR") {
            self.server.addr = addr;
        }
        if let Some(enabled) = env_value("STREAMER_UPLOAD_ENABLED") {
            self.pipeline.upload.enabled = parse_bool("STREAMER_UPLOAD_ENABLED", &enabled)?;
        }
        if let Some(threshold) = env_parse("STREAMER_UPLOAD_THRESHOLD")? {
            self.pipeline.upload.threshold = threshold;
        }
        if let Some(trigger) = env_value("STREAMER_UPLOAD_TRIGGER") {
            self.pipeline.upload.trigger = trigger.parse()?;
        }
        if let Some(url) = env_value("STREAMER_UPLOAD_URL") {
            self.upload.url = url;
        }
        if let Some(key) = env_value("STREAMER_UPLOAD_API_KEY") {
            self.upload.api_key = Some(key);
        }
        Ok(())
    }

    /// Change the frame geometry everywhere it is recorded.
    pub fn set_shape(&mut self, shape: FrameShape) {
        self.source.shape = shape;
        self.pipeline.shape = shape;
    }

    pub fn validate(&self) -> Result<()> {
        let shape = self.pipeline.shape;
        if shape.width == 0 || shape.height == 0 {
            return Err(anyhow!("frame width and height must be greater than zero"));
        }
        if self.channels != RGB_CHANNELS {
            return Err(anyhow!(
                "only {}-channel RGB frames are supported, got {}",
                RGB_CHANNELS,
                self.channels
            ));
        }
        if self.pipeline.skip_factor == 0 {
            return Err(anyhow!("skip_factor must be at least 1"));
        }
        if self.pipeline.stickiness == 0 {
            return Err(anyhow!("stickiness must be at least 1"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if self.model.input.width == 0 || self.model.input.height == 0 {
            return Err(anyhow!("model input dimensions must be greater than zero"));
        }
        for (name, value) in [
            ("display_threshold", self.overlay.display_threshold),
            ("upload threshold", self.pipeline.upload.threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.pipeline.upload.enabled && self.upload.api_key.is_none() {
            return Err(anyhow!(
                "uploads are enabled but no api key is configured (STREAMER_UPLOAD_API_KEY)"
            ));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
