use anyhow::{anyhow, Result};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use super::stats::PipelineStats;
use super::WorkMessage;
use crate::frame::{Frame, SharedFrameBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a classification frame under the skip factor.
    Skipped,
    Submitted(u64),
    /// Work queue at capacity; the submission was abandoned.
    QueueFull(u64),
    /// The classification worker has exited.
    WorkerGone(u64),
}

/// Decides which frames go to the classification worker.
///
/// Every `skip_factor`-th produced frame (starting with the first) is
/// written into the shared buffer and its index offered to the work queue
/// without blocking.
pub struct Dispatcher {
    buffer: Arc<SharedFrameBuffer>,
    work_tx: SyncSender<WorkMessage>,
    skip_factor: u64,
    counter: u64,
    worker_gone_reported: bool,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        buffer: Arc<SharedFrameBuffer>,
        work_tx: SyncSender<WorkMessage>,
        skip_factor: u32,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        if skip_factor == 0 {
            return Err(anyhow!("skip factor must be at least 1"));
        }
        Ok(Self {
            buffer,
            work_tx,
            skip_factor: skip_factor as u64,
            counter: 0,
            worker_gone_reported: false,
            stats,
        })
    }

    pub fn dispatch(&mut self, frame: &Frame) -> Result<DispatchOutcome> {
        let due = self.counter % self.skip_factor == 0;
        self.counter += 1;
        if !due {
            return Ok(DispatchOutcome::Skipped);
        }

        self.buffer.write(frame)?;
        match self.work_tx.try_send(WorkMessage::Frame(frame.index)) {
            Ok(()) => {
                self.stats.frame_dispatched();
                log::debug!("Dispatcher: submitted frame {}", frame.index);
                Ok(DispatchOutcome::Submitted(frame.index))
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dispatch_dropped();
                log::debug!("Dispatcher: work queue full, dropped frame {}", frame.index);
                Ok(DispatchOutcome::QueueFull(frame.index))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dispatch_dropped();
                if !self.worker_gone_reported {
                    log::warn!("Dispatcher: classification worker is gone; streaming without overlays");
                    self.worker_gone_reported = true;
                }
                Ok(DispatchOutcome::WorkerGone(frame.index))
            }
        }
    }

    /// Offer the stop message to the worker without blocking.
    ///
    /// Returns false when the queue is full or the worker is gone; the
    /// shared stop flag covers those cases.
    pub(crate) fn offer_stop(&self) -> bool {
        self.work_tx.try_send(WorkMessage::Stop).is_ok()
    }
}
