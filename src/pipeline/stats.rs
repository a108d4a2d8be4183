use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the producer loop, both workers and the HTTP
/// health endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_produced: AtomicU64,
    frames_dispatched: AtomicU64,
    dispatch_dropped: AtomicU64,
    results_published: AtomicU64,
    results_dropped: AtomicU64,
    inference_failures: AtomicU64,
    frames_streamed: AtomicU64,
    encode_failures: AtomicU64,
    uploads_queued: AtomicU64,
    uploads_dropped: AtomicU64,
    uploads_sent: AtomicU64,
    uploads_failed: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_produced: u64,
    pub frames_dispatched: u64,
    pub dispatch_dropped: u64,
    pub results_published: u64,
    pub results_dropped: u64,
    pub inference_failures: u64,
    pub frames_streamed: u64,
    pub encode_failures: u64,
    pub uploads_queued: u64,
    pub uploads_dropped: u64,
    pub uploads_sent: u64,
    pub uploads_failed: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl PipelineStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    frame_produced => frames_produced,
    frame_dispatched => frames_dispatched,
    dispatch_dropped => dispatch_dropped,
    result_published => results_published,
    result_dropped => results_dropped,
    inference_failed => inference_failures,
    frame_streamed => frames_streamed,
    encode_failed => encode_failures,
    upload_queued => uploads_queued,
    upload_dropped => uploads_dropped,
    upload_sent => uploads_sent,
    upload_failed => uploads_failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PipelineStats::default();
        stats.frame_produced();
        stats.frame_produced();
        stats.dispatch_dropped();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_produced, 2);
        assert_eq!(snap.dispatch_dropped, 1);
        assert_eq!(snap.uploads_sent, 0);
    }
}
