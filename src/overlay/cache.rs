use std::sync::mpsc::Receiver;

use crate::detect::DetectionResult;

/// Most recent detection result with a display lifetime.
///
/// A result that arrives while frame `k` is being produced is shown on frames
/// `k ..= k + stickiness - 1` and cleared at `k + stickiness`. Any newer
/// result replaces the stored one and restarts the count.
#[derive(Debug)]
pub struct ResultCache {
    stickiness: u64,
    current: Option<Cached>,
}

#[derive(Debug)]
struct Cached {
    result: DetectionResult,
    arrived_at_frame: u64,
}

impl ResultCache {
    pub fn new(stickiness: u32) -> Self {
        Self {
            stickiness: stickiness.max(1) as u64,
            current: None,
        }
    }

    /// Store `result` as the newest, arriving at `frame_index`.
    pub fn update(&mut self, result: DetectionResult, frame_index: u64) {
        self.current = Some(Cached {
            result,
            arrived_at_frame: frame_index,
        });
    }

    /// Drain every queued result without blocking, keeping only the last.
    ///
    /// Returns the number of results drained.
    pub fn drain(&mut self, rx: &Receiver<DetectionResult>, frame_index: u64) -> usize {
        let mut drained = 0;
        let mut newest = None;
        for result in rx.try_iter() {
            drained += 1;
            newest = Some(result);
        }
        if let Some(result) = newest {
            log::debug!(
                "ResultCache: result for frame {} shown from frame {} ({} drained)",
                result.frame_index,
                frame_index,
                drained
            );
            self.update(result, frame_index);
        }
        drained
    }

    /// Result to draw on `frame_index`, clearing it once it has expired.
    pub fn current(&mut self, frame_index: u64) -> Option<&DetectionResult> {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|c| frame_index.saturating_sub(c.arrived_at_frame) >= self.stickiness);
        if expired {
            self.current = None;
        }
        self.current.as_ref().map(|c| &c.result)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
