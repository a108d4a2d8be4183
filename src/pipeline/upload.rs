//! Training-sample upload.
//!
//! The classification worker flags frames whose detections satisfy the
//! configured `UploadPolicy`; the upload worker JPEG-encodes them and hands
//! them to an `Uploader`. Upload failures are logged and never retried.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use super::stats::PipelineStats;
use super::{UploadItem, UploadMessage, WorkerHandle};
use crate::detect::BoundingBox;
use crate::stream::encode_jpeg;

/// Default Edge Impulse ingestion endpoint for training samples.
pub const DEFAULT_INGESTION_URL: &str = "https://ingestion.edgeimpulse.com/api/training/files";

/// Which side of the threshold triggers an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTrigger {
    /// Upload when any box is at or below the threshold (uncertain samples).
    AtOrBelow,
    /// Upload when any box is at or above the threshold (confident samples).
    AtOrAbove,
}

impl std::str::FromStr for UploadTrigger {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "at_or_below" | "below" => Ok(Self::AtOrBelow),
            "at_or_above" | "above" => Ok(Self::AtOrAbove),
            other => Err(anyhow!(
                "unknown upload trigger '{}'; expected at_or_below or at_or_above",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UploadPolicy {
    pub enabled: bool,
    pub threshold: f32,
    pub trigger: UploadTrigger,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 1.0,
            trigger: UploadTrigger::AtOrBelow,
        }
    }
}

impl UploadPolicy {
    /// True when `boxes` should be uploaded. Empty results never are.
    pub fn matches(&self, boxes: &[BoundingBox]) -> bool {
        if !self.enabled {
            return false;
        }
        boxes.iter().any(|b| match self.trigger {
            UploadTrigger::AtOrBelow => b.confidence <= self.threshold,
            UploadTrigger::AtOrAbove => b.confidence >= self.threshold,
        })
    }
}

/// One encoded sample ready for transmission.
#[derive(Clone, Debug)]
pub struct UploadSample {
    pub filename: String,
    pub jpeg: Vec<u8>,
    pub boxes: Vec<BoundingBox>,
}

impl UploadSample {
    pub fn new(jpeg: Vec<u8>, boxes: Vec<BoundingBox>) -> Self {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Self {
            filename: format!("image_{}.jpg", timestamp),
            jpeg,
            boxes,
        }
    }
}

/// Remote sample store.
pub trait Uploader: Send {
    fn name(&self) -> &str;

    /// Transmit one sample. Returns a short description of the stored sample.
    fn upload(&mut self, sample: &UploadSample) -> Result<String>;
}

/// Uploader used when uploads are turned off. Discards every sample.
#[derive(Debug, Default)]
pub struct DisabledUploader;

impl Uploader for DisabledUploader {
    fn name(&self) -> &str {
        "disabled"
    }

    fn upload(&mut self, sample: &UploadSample) -> Result<String> {
        log::debug!("DisabledUploader: discarding {}", sample.filename);
        Ok(format!("discarded {}", sample.filename))
    }
}

/// Bounding-box metadata in the ingestion service's `x-metadata` layout.
///
/// Each field is a stringified list, one entry per box.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BoxMetadata {
    pub version: String,
    pub labels: String,
    pub x: String,
    pub y: String,
    pub width: String,
    pub height: String,
    pub value: String,
}

impl BoxMetadata {
    pub fn new(version: &str, boxes: &[BoundingBox]) -> Self {
        Self {
            version: version.to_string(),
            labels: list(boxes.iter().map(|b| format!("'{}'", b.label.replace('\'', "\\'")))),
            x: list(boxes.iter().map(|b| b.x.to_string())),
            y: list(boxes.iter().map(|b| b.y.to_string())),
            width: list(boxes.iter().map(|b| b.width.to_string())),
            height: list(boxes.iter().map(|b| b.height.to_string())),
            value: list(boxes.iter().map(|b| float_repr(b.confidence))),
        }
    }
}

fn list(items: impl Iterator<Item = String>) -> String {
    format!("[{}]", items.collect::<Vec<_>>().join(", "))
}

/// Shortest decimal that reads back as the same `f32`.
fn float_repr(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct IngestionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    files: Vec<IngestionFile>,
}

#[derive(Debug, Deserialize)]
struct IngestionFile {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts samples to an Edge Impulse style ingestion endpoint.
pub struct IngestionUploader {
    url: String,
    api_key: String,
    model_version: String,
    agent: ureq::Agent,
}

impl IngestionUploader {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model_version: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            url: url.into(),
            api_key: api_key.into(),
            model_version: model_version.into(),
            agent,
        }
    }

    /// Build the `multipart/form-data` body for `sample`.
    ///
    /// Returns the content type (with boundary) and the body.
    pub fn multipart_body(sample: &UploadSample) -> (String, Vec<u8>) {
        let boundary = format!("----camera-streamer-{:016x}", rand::thread_rng().gen::<u64>());
        let mut body = Vec::with_capacity(sample.jpeg.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"data\"; filename=\"{}\"\r\n",
                sample.filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&sample.jpeg);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        (format!("multipart/form-data; boundary={}", boundary), body)
    }
}

impl Uploader for IngestionUploader {
    fn name(&self) -> &str {
        "ingestion"
    }

    fn upload(&mut self, sample: &UploadSample) -> Result<String> {
        let metadata = serde_json::to_string(&BoxMetadata::new(&self.model_version, &sample.boxes))?;
        let (content_type, body) = Self::multipart_body(sample);

        let response = self
            .agent
            .post(&self.url)
            .set("x-api-key", &self.api_key)
            .set("x-metadata", &metadata)
            .set("x-disallow-duplicates", "true")
            .set("Content-Type", &content_type)
            .send_bytes(&body);

        let (status, text) = match response {
            Ok(response) => {
                let status = response.status();
                (status, read_body(response)?)
            }
            Err(ureq::Error::Status(status, response)) => (status, read_body(response)?),
            Err(err) => return Err(anyhow::Error::new(err).context("post sample to ingestion service")),
        };

        let parsed: IngestionResponse = serde_json::from_str(&text).map_err(|_| {
            anyhow!("failed to upload {}: {} - {}", sample.filename, status, text.trim())
        })?;
        if !parsed.success {
            return Err(anyhow!(
                "failed to upload {}: {} - {}",
                sample.filename,
                status,
                parsed.error.unwrap_or(text)
            ));
        }
        let errors: Vec<String> = parsed
            .files
            .iter()
            .filter(|f| !f.success)
            .map(|f| f.error.clone().unwrap_or_else(|| "unknown error".to_string()))
            .collect();
        if !errors.is_empty() {
            return Err(anyhow!("failed to upload {}: {:?}", sample.filename, errors));
        }
        Ok(format!("uploaded {}", sample.filename))
    }
}

fn read_body(response: ureq::Response) -> Result<String> {
    let mut text = String::new();
    response
        .into_reader()
        .take(1024 * 1024)
        .read_to_string(&mut text)
        .context("read ingestion response")?;
    Ok(text)
}

/// Worker that drains the upload queue.
pub struct UploadWorker {
    uploader: Box<dyn Uploader>,
    rx: Receiver<UploadMessage>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    jpeg_quality: u8,
}

impl UploadWorker {
    pub fn new(
        uploader: Box<dyn Uploader>,
        rx: Receiver<UploadMessage>,
        stop: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            uploader,
            rx,
            stop,
            stats,
            jpeg_quality,
        }
    }

    pub fn spawn(self) -> Result<WorkerHandle> {
        let join = std::thread::Builder::new()
            .name("upload".to_string())
            .spawn(move || self.run())
            .context("spawn upload worker")?;
        Ok(WorkerHandle::new("upload", join))
    }

    fn run(mut self) {
        log::info!("UploadWorker: started ({})", self.uploader.name());
        while let Ok(message) = self.rx.recv() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match message {
                UploadMessage::Stop => break,
                UploadMessage::Item(item) => self.handle(item),
            }
        }
        log::info!("UploadWorker: stopped");
    }

    fn handle(&mut self, item: UploadItem) {
        let jpeg = match encode_jpeg(&item.image, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.stats.upload_failed();
                log::error!("UploadWorker: encode frame {} failed: {:#}", item.frame_index, err);
                return;
            }
        };
        let sample = UploadSample::new(jpeg, item.boxes);
        match self.uploader.upload(&sample) {
            Ok(summary) => {
                self.stats.upload_sent();
                log::info!("UploadWorker: {} (frame {})", summary, item.frame_index);
            }
            Err(err) => {
                self.stats.upload_failed();
                log::error!("UploadWorker: {:#}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::mpsc::sync_channel;
    use std::sync::Mutex;

    fn bb(confidence: f32) -> BoundingBox {
        BoundingBox::new("cat_face", confidence, 216, 112, 8, 8)
    }

    #[test]
    fn policy_direction_is_explicit() {
        let below = UploadPolicy {
            enabled: true,
            threshold: 0.5,
            trigger: UploadTrigger::AtOrBelow,
        };
        let above = UploadPolicy {
            trigger: UploadTrigger::AtOrAbove,
            ..below
        };
        assert!(below.matches(&[bb(0.5)]));
        assert!(below.matches(&[bb(0.9), bb(0.3)]));
        assert!(!below.matches(&[bb(0.9)]));
        assert!(above.matches(&[bb(0.5)]));
        assert!(!above.matches(&[bb(0.3)]));
        assert!(!below.matches(&[]));
        assert!(!UploadPolicy::default().matches(&[bb(0.1)]));
    }

    #[test]
    fn parses_trigger_names() {
        assert_eq!("at_or_below".parse::<UploadTrigger>().unwrap(), UploadTrigger::AtOrBelow);
        assert_eq!("at-or-above".parse::<UploadTrigger>().unwrap(), UploadTrigger::AtOrAbove);
        assert!("sideways".parse::<UploadTrigger>().is_err());
    }

    #[test]
    fn metadata_uses_stringified_lists() -> Result<()> {
        let boxes = vec![
            BoundingBox::new("cat_face", 0.63, 216, 112, 8, 8),
            BoundingBox::new("dog", 1.0, 1, 2, 3, 4),
        ];
        let meta = BoxMetadata::new("testing uploader", &boxes);
        assert_eq!(meta.labels, "['cat_face', 'dog']");
        assert_eq!(meta.x, "[216, 1]");
        assert_eq!(meta.value, "[0.63, 1.0]");
        let json = serde_json::to_string(&meta)?;
        assert!(json.contains(r#""version":"testing uploader""#));
        Ok(())
    }

    #[test]
    fn confidences_print_without_widening_noise() {
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(0.7), "0.7");
        assert_eq!(float_repr(0.95), "0.95");
        assert_eq!(float_repr(0.0), "0.0");
    }

    #[test]
    fn multipart_body_wraps_jpeg() {
        let sample = UploadSample {
            filename: "image_20240101_120000.jpg".to_string(),
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            boxes: vec![],
        };
        let (content_type, body) = IngestionUploader::multipart_body(&sample);
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .expect("boundary");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with(&format!("--{}\r\n", boundary)));
        assert!(text.contains("name=\"data\"; filename=\"image_20240101_120000.jpg\""));
        assert!(text.contains("Content-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with(&format!("--{}--\r\n", boundary)));
    }

    #[test]
    fn sample_filename_is_timestamped() {
        let sample = UploadSample::new(vec![], vec![]);
        assert!(sample.filename.starts_with("image_"));
        assert!(sample.filename.ends_with(".jpg"));
        assert_eq!(sample.filename.len(), "image_YYYYmmdd_HHMMSS.jpg".len());
    }

    struct Recording {
        seen: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Uploader for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn upload(&mut self, sample: &UploadSample) -> Result<String> {
            self.seen.lock().unwrap().push(sample.boxes.len());
            if self.fail {
                return Err(anyhow!("remote store unavailable"));
            }
            Ok("ok".to_string())
        }
    }

    fn item(index: u64) -> UploadMessage {
        UploadMessage::Item(UploadItem {
            frame_index: index,
            image: RgbImage::new(8, 8),
            boxes: vec![bb(0.4)],
        })
    }

    #[test]
    fn failures_are_counted_and_the_worker_keeps_going() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = sync_channel(4);
        let uploader = Recording {
            seen: seen.clone(),
            fail: true,
        };
        let mut handle = UploadWorker::new(
            Box::new(uploader),
            rx,
            Arc::new(AtomicBool::new(false)),
            stats.clone(),
            80,
        )
        .spawn()?;

        tx.send(item(0))?;
        tx.send(item(1))?;
        tx.send(UploadMessage::Stop)?;
        handle.join()?;

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(stats.snapshot().uploads_failed, 2);
        Ok(())
    }
}
