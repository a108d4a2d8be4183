use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::stats::PipelineStats;
use super::upload::UploadPolicy;
use super::{UploadItem, UploadMessage, WorkMessage};
use crate::detect::{DetectionResult, InferenceEngine};
use crate::frame::SharedFrameBuffer;

/// Join handle for a pipeline worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, join: JoinHandle<()>) -> Self {
        Self {
            name,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Wait for the thread to exit. Later calls return immediately.
    pub fn join(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} worker thread panicked", self.name))?;
        }
        Ok(())
    }
}

/// Runs inference off the producer thread.
///
/// Each `WorkMessage::Frame` makes the worker copy the shared buffer,
/// extract features and classify. Results go to the result queue and, when
/// the upload policy matches, a snapshot goes to the upload queue. Neither
/// send blocks; a full queue drops the item.
pub struct ClassificationWorker {
    engine: Box<dyn InferenceEngine>,
    buffer: Arc<SharedFrameBuffer>,
    work_rx: Receiver<WorkMessage>,
    result_tx: SyncSender<DetectionResult>,
    upload_tx: SyncSender<UploadMessage>,
    policy: UploadPolicy,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl ClassificationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        buffer: Arc<SharedFrameBuffer>,
        work_rx: Receiver<WorkMessage>,
        result_tx: SyncSender<DetectionResult>,
        upload_tx: SyncSender<UploadMessage>,
        policy: UploadPolicy,
        stop: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            engine,
            buffer,
            work_rx,
            result_tx,
            upload_tx,
            policy,
            stop,
            stats,
        }
    }

    pub fn spawn(self) -> Result<WorkerHandle> {
        let join = std::thread::Builder::new()
            .name("classify".to_string())
            .spawn(move || self.run())
            .context("spawn classification worker")?;
        Ok(WorkerHandle::new("classify", join))
    }

    fn run(mut self) {
        let info = match self.engine.init() {
            Ok(info) => info,
            Err(err) => {
                log::error!(
                    "ClassificationWorker: engine {} failed to initialize: {:#}",
                    self.engine.name(),
                    err
                );
                return;
            }
        };
        log::info!(
            "ClassificationWorker: ready ({} {}, input {}x{})",
            self.engine.name(),
            info.version,
            info.input.width,
            info.input.height
        );

        while let Ok(message) = self.work_rx.recv() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match message {
                WorkMessage::Stop => break,
                WorkMessage::Frame(index) => {
                    if let Err(err) = self.process(index) {
                        self.stats.inference_failed();
                        log::warn!("ClassificationWorker: frame {}: {:#}", index, err);
                    }
                }
            }
        }
        log::info!("ClassificationWorker: stopped");
    }

    fn process(&mut self, index: u64) -> Result<()> {
        let frame = self.buffer.read_copy()?;
        let features = self
            .engine
            .extract_features(&frame.image)
            .context("extract features")?;
        let boxes = self.engine.classify(&features).context("classify")?;
        log::debug!(
            "ClassificationWorker: frame {} (buffer frame {}) -> {} boxes",
            index,
            frame.index,
            boxes.len()
        );

        if self.policy.matches(&boxes) {
            let item = UploadItem {
                frame_index: index,
                image: frame.image,
                boxes: boxes.clone(),
            };
            match self.upload_tx.try_send(UploadMessage::Item(item)) {
                Ok(()) => self.stats.upload_queued(),
                Err(TrySendError::Full(_)) => {
                    self.stats.upload_dropped();
                    log::warn!("ClassificationWorker: upload queue full, dropped frame {}", index);
                }
                Err(TrySendError::Disconnected(_)) => self.stats.upload_dropped(),
            }
        }

        match self
            .result_tx
            .try_send(DetectionResult::new(index, features.input, boxes))
        {
            Ok(()) => self.stats.result_published(),
            Err(_) => {
                self.stats.result_dropped();
                log::debug!("ClassificationWorker: result for frame {} dropped", index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ModelInput, StubEngine};
    use crate::frame::FrameShape;
    use crate::pipeline::UploadTrigger;
    use std::sync::mpsc::sync_channel;

    struct Harness {
        work_tx: SyncSender<WorkMessage>,
        result_rx: Receiver<DetectionResult>,
        upload_rx: Receiver<UploadMessage>,
        stop: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
        worker: ClassificationWorker,
    }

    fn harness(work_capacity: usize, upload_capacity: usize, policy: UploadPolicy) -> Harness {
        let (work_tx, work_rx) = sync_channel(work_capacity);
        let (result_tx, result_rx) = sync_channel(16);
        let (upload_tx, upload_rx) = sync_channel(upload_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::default());
        let worker = ClassificationWorker::new(
            Box::new(StubEngine::centered(ModelInput::rgb(32, 32))),
            Arc::new(SharedFrameBuffer::new(FrameShape::new(64, 36))),
            work_rx,
            result_tx,
            upload_tx,
            policy,
            stop.clone(),
            stats.clone(),
        );
        Harness {
            work_tx,
            result_rx,
            upload_rx,
            stop,
            stats,
            worker,
        }
    }

    fn upload_everything() -> UploadPolicy {
        UploadPolicy {
            enabled: true,
            threshold: 1.0,
            trigger: UploadTrigger::AtOrBelow,
        }
    }

    #[test]
    fn stop_flag_discards_queued_frames() -> Result<()> {
        let h = harness(8, 8, UploadPolicy::default());
        for index in 0..4 {
            h.work_tx.try_send(WorkMessage::Frame(index))?;
        }
        h.work_tx.try_send(WorkMessage::Stop)?;
        h.stop.store(true, Ordering::SeqCst);

        let mut handle = h.worker.spawn()?;
        handle.join()?;
        assert!(handle.is_finished());
        assert_eq!(handle.name(), "classify");
        assert_eq!(h.stats.snapshot().results_published, 0);
        assert!(h.result_rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn stop_message_ends_the_worker_after_earlier_frames() -> Result<()> {
        let h = harness(8, 8, UploadPolicy::default());
        for index in 0..3 {
            h.work_tx.try_send(WorkMessage::Frame(index))?;
        }
        h.work_tx.try_send(WorkMessage::Stop)?;
        h.work_tx.try_send(WorkMessage::Frame(99))?;

        let mut handle = h.worker.spawn()?;
        handle.join()?;
        let indices: Vec<u64> = h.result_rx.try_iter().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(h.stats.snapshot().results_published, 3);
        Ok(())
    }

    #[test]
    fn closed_work_queue_ends_the_worker() -> Result<()> {
        let h = harness(2, 2, UploadPolicy::default());
        let mut handle = h.worker.spawn()?;
        drop(h.work_tx);
        handle.join()?;
        assert_eq!(h.stats.snapshot().results_published, 0);
        Ok(())
    }

    #[test]
    fn full_upload_queue_drops_without_blocking() -> Result<()> {
        let h = harness(8, 1, upload_everything());
        for index in 0..4 {
            h.work_tx.try_send(WorkMessage::Frame(index))?;
        }
        h.work_tx.try_send(WorkMessage::Stop)?;

        // Nothing drains the upload queue while the worker runs.
        let mut handle = h.worker.spawn()?;
        handle.join()?;
        let snap = h.stats.snapshot();
        assert_eq!(snap.results_published, 4);
        assert_eq!(snap.uploads_queued, 1);
        assert_eq!(snap.uploads_dropped, 3);
        match h.upload_rx.try_recv()? {
            UploadMessage::Item(item) => assert_eq!(item.frame_index, 0),
            UploadMessage::Stop => panic!("unexpected stop message"),
        }
        Ok(())
    }

    #[test]
    fn full_result_queue_drops_results() -> Result<()> {
        let (work_tx, work_rx) = sync_channel(8);
        let (result_tx, result_rx) = sync_channel(1);
        let (upload_tx, _upload_rx) = sync_channel(1);
        let stats = Arc::new(PipelineStats::default());
        let worker = ClassificationWorker::new(
            Box::new(StubEngine::empty(ModelInput::rgb(16, 16))),
            Arc::new(SharedFrameBuffer::new(FrameShape::new(32, 32))),
            work_rx,
            result_tx,
            upload_tx,
            UploadPolicy::default(),
            Arc::new(AtomicBool::new(false)),
            stats.clone(),
        );
        for index in 0..3 {
            work_tx.try_send(WorkMessage::Frame(index))?;
        }
        work_tx.try_send(WorkMessage::Stop)?;

        let mut handle = worker.spawn()?;
        handle.join()?;
        let snap = stats.snapshot();
        assert_eq!(snap.results_published, 1);
        assert_eq!(snap.results_dropped, 2);
        assert_eq!(result_rx.try_recv()?.frame_index, 0);
        Ok(())
    }
}
