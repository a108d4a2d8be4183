//! Camera streamer with asynchronous object detection.
//!
//! Frames are read from a camera, streamed to HTTP clients as MJPEG, and
//! periodically classified on a background worker. The latest detections
//! are drawn onto the outgoing frames for a bounded number of frames, and
//! frames matching an upload policy are sent to a training-data ingestion
//! service.
//!
//! # Architecture
//!
//! The producer thread never waits on inference or upload:
//!
//! 1. **Acquire**: a `FrameSource` yields frames, either demuxed from an
//!    MJPEG byte stream or captured one at a time.
//! 2. **Dispatch**: every N-th frame is copied into the `SharedFrameBuffer`
//!    and its index offered to the classification queue.
//! 3. **Classify**: the worker copies the buffer out, extracts features and
//!    publishes a `DetectionResult`.
//! 4. **Annotate**: the producer keeps the latest result sticky for a fixed
//!    number of frames and draws it onto each frame it covers.
//! 5. **Encode**: annotated frames become multipart JPEG parts on the
//!    `StreamHub`, which the HTTP server fans out to clients.
//!
//! # Module Structure
//!
//! - `frame`: frame geometry and the single-slot shared buffer
//! - `ingest`: frame sources (MJPEG stream, single-shot capture)
//! - `detect`: inference engines and detection types
//! - `pipeline`: dispatcher, workers, lifecycle and counters
//! - `overlay`: result stickiness and frame annotation
//! - `stream`: JPEG encoding and stream fan-out
//! - `server`: HTTP endpoints
//! - `config`: file and environment configuration

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod server;
pub mod stream;

pub use config::StreamerConfig;
pub use detect::{BoundingBox, DetectionResult, InferenceEngine, ModelInput};
pub use frame::{Frame, FrameShape, SharedFrameBuffer};
pub use ingest::{FrameOutcome, FrameSource, SourceConfig, SourceMode};
pub use overlay::{Annotator, ResultCache};
pub use pipeline::{Pipeline, PipelineConfig, PipelineState, PipelineStats};
pub use stream::{StreamChunk, StreamEncoder, StreamHub};
