use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use camera_streamer::detect::{
    extract_packed_features, BoundingBox, Features, InferenceEngine, ModelInfo, StubEngine,
};
use camera_streamer::ingest::SyntheticCapture;
use camera_streamer::pipeline::{
    ClassificationWorker, DisabledUploader, DispatchOutcome, Dispatcher, StatsSnapshot, Tick,
    UploadMessage, UploadPolicy, UploadSample, UploadTrigger, Uploader, WorkMessage,
};
use camera_streamer::stream::encode_jpeg;
use camera_streamer::{
    Annotator, DetectionResult, FrameOutcome, FrameShape, FrameSource, ModelInput, Pipeline,
    PipelineConfig, PipelineState, PipelineStats, SharedFrameBuffer, StreamHub,
};

const SHAPE: FrameShape = FrameShape {
    width: 64,
    height: 36,
};

fn jpeg_stream(count: u8) -> Vec<u8> {
    let mut bytes = Vec::new();
    for i in 0..count {
        let image = RgbImage::from_pixel(SHAPE.width, SHAPE.height, Rgb([20 * i, 90, 160]));
        bytes.extend(encode_jpeg(&image, 90).expect("encode test jpeg"));
    }
    bytes
}

fn synthetic_source() -> FrameSource {
    FrameSource::from_capture(
        Box::new(SyntheticCapture::new("stub://flow", SHAPE, 0)),
        SHAPE,
        0,
    )
    .expect("synthetic source")
}

fn wait_for(stats: &PipelineStats, done: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snap = stats.snapshot();
        if done(&snap) || Instant::now() > deadline {
            return snap;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Records the top-left red value of every frame it is asked to classify.
struct RecordingEngine {
    input: ModelInput,
    seen: Arc<Mutex<Vec<u8>>>,
}

impl InferenceEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn init(&mut self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            input: self.input,
            labels: vec!["object".to_string()],
            version: "recording".to_string(),
        })
    }

    fn extract_features(&mut self, frame: &RgbImage) -> Result<Features> {
        self.seen
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push(frame.get_pixel(0, 0)[0]);
        extract_packed_features(frame, self.input)
    }

    fn classify(&mut self, _features: &Features) -> Result<Vec<BoundingBox>> {
        Ok(vec![BoundingBox::new("object", 0.9, 12, 12, 8, 8)])
    }
}

#[test]
fn demuxed_frames_reach_the_worker_in_order() -> Result<()> {
    let mut source =
        FrameSource::from_reader(Box::new(Cursor::new(jpeg_stream(3))), "test", SHAPE);
    let buffer = Arc::new(SharedFrameBuffer::new(SHAPE));
    let stats = Arc::new(PipelineStats::default());
    let stop = Arc::new(AtomicBool::new(false));

    let (work_tx, work_rx) = sync_channel(10);
    let (result_tx, result_rx) = sync_channel(10);
    let (upload_tx, _upload_rx) = sync_channel::<UploadMessage>(10);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(buffer.clone(), work_tx, 1, stats.clone())?;
    let mut worker = ClassificationWorker::new(
        Box::new(RecordingEngine {
            input: ModelInput::rgb(32, 32),
            seen: seen.clone(),
        }),
        buffer,
        work_rx,
        result_tx,
        upload_tx,
        UploadPolicy::default(),
        stop,
        stats.clone(),
    )
    .spawn()?;

    let mut submitted = Vec::new();
    loop {
        match source.next_frame()? {
            FrameOutcome::Frame(frame) => match dispatcher.dispatch(&frame)? {
                DispatchOutcome::Submitted(index) => {
                    submitted.push(index);
                    // Let the worker copy the buffer before the next overwrite.
                    wait_for(&stats, |s| s.results_published == submitted.len() as u64);
                }
                other => return Err(anyhow!("unexpected dispatch outcome {:?}", other)),
            },
            FrameOutcome::NoFrame => continue,
            FrameOutcome::End => break,
        }
    }
    assert_eq!(submitted, vec![0, 1, 2]);

    let results: Vec<DetectionResult> = (0..3)
        .map(|_| result_rx.recv_timeout(Duration::from_secs(5)))
        .collect::<std::result::Result<_, _>>()?;
    let indices: Vec<u64> = results.iter().map(|r| r.frame_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(results.iter().all(|r| r.boxes.len() == 1));
    assert!(results.iter().all(|r| r.input == ModelInput::rgb(32, 32)));

    // Each classification saw its own frame's pixels, within JPEG error.
    let seen = seen.lock().map_err(|_| anyhow!("poisoned"))?.clone();
    assert_eq!(seen.len(), 3);
    for (i, red) in seen.iter().enumerate() {
        let expected = 20 * i as i32;
        assert!(
            (i32::from(*red) - expected).abs() <= 6,
            "frame {} red {} expected about {}",
            i,
            red,
            expected
        );
    }

    // Dropping the dispatcher closes the work queue.
    drop(dispatcher);
    worker.join()?;
    assert_eq!(source.stats().frames_produced, 3);
    Ok(())
}

#[test]
fn skip_factor_selects_every_nth_frame() -> Result<()> {
    let buffer = Arc::new(SharedFrameBuffer::new(SHAPE));
    let (work_tx, work_rx) = sync_channel(32);
    let mut dispatcher = Dispatcher::new(buffer, work_tx, 3, Arc::new(PipelineStats::default()))?;
    let mut source = synthetic_source();

    for _ in 0..10 {
        if let FrameOutcome::Frame(frame) = source.next_frame()? {
            dispatcher.dispatch(&frame)?;
        }
    }
    let sent: Vec<WorkMessage> = work_rx.try_iter().collect();
    assert_eq!(
        sent,
        vec![
            WorkMessage::Frame(0),
            WorkMessage::Frame(3),
            WorkMessage::Frame(6),
            WorkMessage::Frame(9)
        ]
    );
    Ok(())
}

fn pipeline_with(
    source: FrameSource,
    engine: StubEngine,
    uploader: Box<dyn Uploader>,
    config: PipelineConfig,
) -> Pipeline {
    Pipeline::new(config, source, Box::new(engine), uploader, Annotator::new(0.0))
        .expect("pipeline")
}

#[test]
fn stream_ends_and_shutdown_is_idempotent() -> Result<()> {
    let source = FrameSource::from_reader(Box::new(Cursor::new(jpeg_stream(4))), "test", SHAPE);
    let config = PipelineConfig {
        shape: SHAPE,
        skip_factor: 2,
        ..PipelineConfig::default()
    };
    let mut pipeline = pipeline_with(
        source,
        StubEngine::empty(ModelInput::rgb(32, 32)),
        Box::new(DisabledUploader),
        config,
    );
    let hub = StreamHub::new();
    let shutdown = AtomicBool::new(false);

    pipeline.run(&hub, &shutdown)?;

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(hub.generation()?, 4);
    let latest = hub.latest()?.expect("published frame");
    assert_eq!(latest.frame_index, 3);

    let snap = pipeline.stats().snapshot();
    assert_eq!(snap.frames_produced, 4);
    assert_eq!(snap.frames_streamed, 4);
    assert_eq!(snap.frames_dispatched + snap.dispatch_dropped, 2);

    pipeline.shutdown()?;
    pipeline.shutdown()?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok(())
}

#[test]
fn detections_are_drawn_on_streamed_frames() -> Result<()> {
    let config = PipelineConfig {
        shape: SHAPE,
        skip_factor: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = pipeline_with(
        synthetic_source(),
        StubEngine::centered(ModelInput::rgb(32, 32)),
        Box::new(DisabledUploader),
        config,
    );
    pipeline.start()?;
    let stats = pipeline.stats();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut marked = false;
    while !marked && Instant::now() < deadline {
        if let Tick::Frame(chunk) = pipeline.tick()? {
            if stats.snapshot().results_published == 0 {
                continue;
            }
            let image = image::load_from_memory(chunk.jpeg())?.into_rgb8();
            // The stub box is centred, so its marker lands on the frame centre.
            let Rgb([r, g, b]) = *image.get_pixel(SHAPE.width / 2, SHAPE.height / 2);
            marked = r > 200 && g < 80 && b < 80;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(marked, "no frame carried the detection marker");
    pipeline.shutdown()?;
    Ok(())
}

#[test]
fn worker_init_failure_keeps_streaming() -> Result<()> {
    let config = PipelineConfig {
        shape: SHAPE,
        skip_factor: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = pipeline_with(
        synthetic_source(),
        StubEngine::failing_init(ModelInput::rgb(32, 32)),
        Box::new(DisabledUploader),
        config,
    );
    pipeline.start()?;
    let stats = pipeline.stats();

    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.snapshot().dispatch_dropped == 0 && Instant::now() < deadline {
        assert!(matches!(pipeline.tick()?, Tick::Frame(_)));
        std::thread::sleep(Duration::from_millis(2));
    }
    for _ in 0..5 {
        assert!(matches!(pipeline.tick()?, Tick::Frame(_)));
    }
    let snap = stats.snapshot();
    assert!(snap.dispatch_dropped > 0);
    assert_eq!(snap.results_published, 0);
    assert_eq!(snap.frames_streamed, snap.frames_produced);

    pipeline.shutdown()?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok(())
}

struct RecordingUploader {
    uploads: Arc<Mutex<Vec<UploadSample>>>,
}

impl Uploader for RecordingUploader {
    fn name(&self) -> &str {
        "recording"
    }

    fn upload(&mut self, sample: &UploadSample) -> Result<String> {
        self.uploads
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push(sample.clone());
        Ok(format!("stored {}", sample.filename))
    }
}

#[test]
fn matching_detections_are_uploaded() -> Result<()> {
    let uploads = Arc::new(Mutex::new(Vec::new()));
    let config = PipelineConfig {
        shape: SHAPE,
        skip_factor: 1,
        upload: UploadPolicy {
            enabled: true,
            threshold: 0.95,
            trigger: UploadTrigger::AtOrBelow,
        },
        ..PipelineConfig::default()
    };
    let mut pipeline = pipeline_with(
        synthetic_source(),
        StubEngine::centered(ModelInput::rgb(32, 32)),
        Box::new(RecordingUploader {
            uploads: uploads.clone(),
        }),
        config,
    );
    pipeline.start()?;
    let stats = pipeline.stats();

    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.snapshot().uploads_sent == 0 && Instant::now() < deadline {
        pipeline.tick()?;
        std::thread::sleep(Duration::from_millis(5));
    }
    pipeline.shutdown()?;

    let uploads = uploads.lock().map_err(|_| anyhow!("poisoned"))?;
    assert!(!uploads.is_empty());
    let sample = &uploads[0];
    assert!(sample.filename.starts_with("image_"));
    assert!(sample.filename.ends_with(".jpg"));
    assert_eq!(&sample.jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(sample.boxes.len(), 1);
    assert_eq!(sample.boxes[0].label, "object");
    Ok(())
}

#[test]
fn confident_detections_are_not_uploaded_below_threshold() -> Result<()> {
    let uploads = Arc::new(Mutex::new(Vec::new()));
    let config = PipelineConfig {
        shape: SHAPE,
        skip_factor: 1,
        upload: UploadPolicy {
            enabled: true,
            threshold: 0.5,
            trigger: UploadTrigger::AtOrBelow,
        },
        ..PipelineConfig::default()
    };
    let mut pipeline = pipeline_with(
        synthetic_source(),
        StubEngine::centered(ModelInput::rgb(32, 32)),
        Box::new(RecordingUploader {
            uploads: uploads.clone(),
        }),
        config,
    );
    pipeline.start()?;
    let stats = pipeline.stats();
    for _ in 0..10 {
        pipeline.tick()?;
    }
    let snap = wait_for(&stats, |s| s.results_published > 0);
    pipeline.shutdown()?;

    assert!(snap.results_published > 0);
    assert_eq!(stats.snapshot().uploads_queued, 0);
    assert!(uploads.lock().map_err(|_| anyhow!("poisoned"))?.is_empty());
    Ok(())
}
