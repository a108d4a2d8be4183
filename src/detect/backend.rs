use anyhow::Result;
use image::RgbImage;

use crate::detect::features::Features;
use crate::detect::result::{BoundingBox, ModelInput};

/// Model metadata reported by an engine after initialization.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub input: ModelInput,
    pub labels: Vec<String>,
    /// Human-readable model version, attached to uploaded samples.
    pub version: String,
}

/// Inference engine used by the classification worker.
///
/// Engines are constructed on the producer side and moved into the worker
/// thread; `init` runs on the worker so model loading never stalls the
/// stream. All methods are called from that single thread.
pub trait InferenceEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &str;

    /// Load the model and report its input geometry.
    fn init(&mut self) -> Result<ModelInfo>;

    /// Resize and colour-convert `frame` into the model's input features.
    fn extract_features(&mut self, frame: &RgbImage) -> Result<Features>;

    /// Run the model. Returned boxes are in model input coordinates.
    fn classify(&mut self, features: &Features) -> Result<Vec<BoundingBox>>;
}
