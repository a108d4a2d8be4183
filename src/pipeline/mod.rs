//! Acquisition → inference → annotation → encode pipeline.
//!
//! `Pipeline` owns every piece of run state: the frame source, the shared
//! frame buffer, the bounded queues, both worker threads and the overlay
//! state. The producer loop runs on the caller's thread and never blocks on
//! the workers:
//!
//! 1. acquire a frame from the `FrameSource`
//! 2. dispatch every `skip_factor`-th frame to the classification worker
//! 3. drain finished detections into the `ResultCache`
//! 4. annotate, re-encode and publish to the `StreamHub`
//!
//! Lifecycle: `Created → Running → Draining → Stopped`. `shutdown` is
//! idempotent and also runs on drop.

mod dispatch;
mod stats;
mod upload;
mod worker;

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{BoundingBox, DetectionResult, InferenceEngine};
use crate::frame::{FrameShape, SharedFrameBuffer};
use crate::ingest::{FrameOutcome, FrameSource};
use crate::overlay::{Annotator, ResultCache};
use crate::stream::{StreamChunk, StreamEncoder, StreamHub};

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use stats::{PipelineStats, StatsSnapshot};
pub use upload::{
    BoxMetadata, DisabledUploader, IngestionUploader, UploadPolicy, UploadSample, UploadTrigger,
    UploadWorker, Uploader, DEFAULT_INGESTION_URL,
};
pub use worker::{ClassificationWorker, WorkerHandle};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Message on the classification work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkMessage {
    /// Classify the shared buffer on behalf of this frame index.
    Frame(u64),
    Stop,
}

/// Frame flagged for upload.
#[derive(Clone, Debug)]
pub struct UploadItem {
    pub frame_index: u64,
    pub image: RgbImage,
    pub boxes: Vec<BoundingBox>,
}

/// Message on the upload queue.
#[derive(Debug)]
pub enum UploadMessage {
    Item(UploadItem),
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub shape: FrameShape,
    pub skip_factor: u32,
    pub queue_capacity: usize,
    pub stickiness: u32,
    pub upload: UploadPolicy,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shape: FrameShape::new(960, 540),
            skip_factor: 8,
            queue_capacity: 10,
            stickiness: 20,
            upload: UploadPolicy::default(),
            jpeg_quality: crate::stream::DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Result of one producer iteration.
#[derive(Debug)]
pub enum Tick {
    /// A frame was produced and encoded.
    Frame(StreamChunk),
    /// Transient source failure; nothing to emit.
    NoFrame,
    /// Encoding failed; the frame was skipped.
    Skipped,
    /// The source is exhausted.
    End,
}

pub struct Pipeline {
    config: PipelineConfig,
    state: PipelineState,
    source: Option<FrameSource>,
    buffer: Arc<SharedFrameBuffer>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    cache: ResultCache,
    annotator: Annotator,
    encoder: StreamEncoder,
    engine: Option<Box<dyn InferenceEngine>>,
    uploader: Option<Box<dyn Uploader>>,
    dispatcher: Option<Dispatcher>,
    result_rx: Option<Receiver<DetectionResult>>,
    upload_tx: Option<SyncSender<UploadMessage>>,
    classifier: Option<WorkerHandle>,
    upload_worker: Option<WorkerHandle>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: FrameSource,
        engine: Box<dyn InferenceEngine>,
        uploader: Box<dyn Uploader>,
        annotator: Annotator,
    ) -> Result<Self> {
        if config.skip_factor == 0 {
            return Err(anyhow!("skip factor must be at least 1"));
        }
        if config.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if source.shape() != config.shape {
            return Err(anyhow!(
                "source shape {:?} does not match pipeline shape {:?}",
                source.shape(),
                config.shape
            ));
        }
        Ok(Self {
            buffer: Arc::new(SharedFrameBuffer::new(config.shape)),
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            cache: ResultCache::new(config.stickiness),
            encoder: StreamEncoder::new(config.jpeg_quality),
            annotator,
            state: PipelineState::Created,
            source: Some(source),
            engine: Some(engine),
            uploader: Some(uploader),
            dispatcher: None,
            result_rx: None,
            upload_tx: None,
            classifier: None,
            upload_worker: None,
            config,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Spawn the classification and upload workers.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Created {
            return Err(anyhow!("pipeline cannot start from {:?}", self.state));
        }
        let engine = self
            .engine
            .take()
            .ok_or_else(|| anyhow!("inference engine already consumed"))?;
        let uploader = self
            .uploader
            .take()
            .ok_or_else(|| anyhow!("uploader already consumed"))?;

        let capacity = self.config.queue_capacity;
        let (work_tx, work_rx) = sync_channel(capacity);
        let (result_tx, result_rx) = sync_channel(capacity);
        let (upload_tx, upload_rx) = sync_channel(capacity);

        self.upload_worker = Some(
            UploadWorker::new(
                uploader,
                upload_rx,
                self.stop.clone(),
                self.stats.clone(),
                self.config.jpeg_quality,
            )
            .spawn()?,
        );
        self.classifier = Some(
            ClassificationWorker::new(
                engine,
                self.buffer.clone(),
                work_rx,
                result_tx,
                upload_tx.clone(),
                self.config.upload,
                self.stop.clone(),
                self.stats.clone(),
            )
            .spawn()?,
        );
        self.dispatcher = Some(Dispatcher::new(
            self.buffer.clone(),
            work_tx,
            self.config.skip_factor,
            self.stats.clone(),
        )?);
        self.result_rx = Some(result_rx);
        self.upload_tx = Some(upload_tx);
        self.state = PipelineState::Running;
        log::info!(
            "Pipeline: running ({}x{}, skip {}, stickiness {}, queue {})",
            self.config.shape.width,
            self.config.shape.height,
            self.config.skip_factor,
            self.config.stickiness,
            capacity
        );
        Ok(())
    }

    /// One producer iteration.
    pub fn tick(&mut self) -> Result<Tick> {
        if self.state != PipelineState::Running {
            return Err(anyhow!("pipeline is not running ({:?})", self.state));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| anyhow!("frame source released"))?;
        let frame = match source.next_frame()? {
            FrameOutcome::Frame(frame) => frame,
            FrameOutcome::NoFrame => return Ok(Tick::NoFrame),
            FrameOutcome::End => return Ok(Tick::End),
        };
        self.stats.frame_produced();

        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.dispatch(&frame)?;
        }
        if let Some(rx) = self.result_rx.as_ref() {
            self.cache.drain(rx, frame.index);
        }

        let index = frame.index;
        let mut image = frame.image;
        if let Some(result) = self.cache.current(index) {
            self.annotator.annotate(&mut image, result);
        }

        match self.encoder.encode(index, &image) {
            Ok(chunk) => {
                self.stats.frame_streamed();
                Ok(Tick::Frame(chunk))
            }
            Err(err) => {
                self.stats.encode_failed();
                log::warn!("Pipeline: frame {} not streamed: {:#}", index, err);
                Ok(Tick::Skipped)
            }
        }
    }

    /// Run the producer loop until `shutdown` is set, the source ends, or an
    /// unrecoverable error occurs. Always shuts the pipeline down.
    pub fn run(&mut self, hub: &StreamHub, shutdown: &AtomicBool) -> Result<()> {
        if self.state == PipelineState::Created {
            self.start()?;
        }
        let mut outcome = Ok(());
        let mut last_health_log = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(Tick::Frame(chunk)) => {
                    if let Err(err) = hub.publish(chunk) {
                        outcome = Err(err);
                        break;
                    }
                }
                Ok(Tick::NoFrame) | Ok(Tick::Skipped) => {}
                Ok(Tick::End) => break,
                Err(err) => {
                    log::error!("Pipeline: stream stopped: {:#}", err);
                    outcome = Err(err);
                    break;
                }
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health_log = Instant::now();
            }
        }
        if let Err(err) = self.shutdown() {
            log::error!("Pipeline: shutdown: {:#}", err);
        }
        outcome
    }

    fn log_health(&mut self) {
        for worker in [self.classifier.as_ref(), self.upload_worker.as_ref()]
            .into_iter()
            .flatten()
        {
            if worker.is_finished() {
                log::warn!("Pipeline: {} worker has exited", worker.name());
            }
        }
        let snap = self.stats.snapshot();
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let healthy = source.is_healthy();
        let source_stats = source.stats();
        log::info!(
            "source={} health={} frames={} dispatched={} dropped={} results={} inference_failures={} uploads={}/{} resets={} decode_failures={}",
            source_stats.source,
            healthy,
            snap.frames_produced,
            snap.frames_dispatched,
            snap.dispatch_dropped,
            snap.results_published,
            snap.inference_failures,
            snap.uploads_sent,
            snap.uploads_queued,
            source_stats.buffer_resets,
            source_stats.decode_failures
        );
    }

    /// Stop both workers and release the source.
    ///
    /// Errors during teardown are logged and teardown continues. Calling
    /// this again after it completed is a no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Stopped | PipelineState::Draining => return Ok(()),
            PipelineState::Created | PipelineState::Running => {}
        }
        self.state = PipelineState::Draining;
        log::info!("Pipeline: draining");
        self.stop.store(true, Ordering::SeqCst);

        if let Some(dispatcher) = self.dispatcher.take() {
            if !dispatcher.offer_stop() {
                log::debug!("Pipeline: work queue full or closed; relying on stop flag");
            }
        }
        if let Some(mut classifier) = self.classifier.take() {
            if let Err(err) = classifier.join() {
                log::error!("Pipeline: {:#}", err);
            }
        }

        if let Some(upload_tx) = self.upload_tx.take() {
            match upload_tx.try_send(UploadMessage::Stop) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    log::debug!("Pipeline: upload queue full; relying on stop flag")
                }
            }
        }
        if let Some(mut upload_worker) = self.upload_worker.take() {
            if let Err(err) = upload_worker.join() {
                log::error!("Pipeline: {:#}", err);
            }
        }

        self.result_rx = None;
        self.cache.clear();
        if let Some(mut source) = self.source.take() {
            if let Err(err) = source.close() {
                log::error!("Pipeline: release source: {:#}", err);
            }
        }
        self.state = PipelineState::Stopped;
        log::info!("Pipeline: stopped");
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Pipeline: shutdown on drop: {:#}", err);
        }
    }
}
