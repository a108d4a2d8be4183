//! Inference engines and detection types.
//!
//! Engines turn a frame into validated `BoundingBox`es in model input
//! coordinates. Mapping back to frame coordinates is the annotator's job.

mod backend;
mod backends;
mod features;
mod registry;
mod result;

pub use backend::{InferenceEngine, ModelInfo};
#[cfg(unix)]
pub use backends::EimEngine;
pub use backends::StubEngine;
pub use features::{extract_packed_features, Features};
pub use registry::{open_engine, EngineSpec};
pub use result::{BoundingBox, DetectionResult, ModelInput, RawBoundingBox};
