use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{InferenceEngine, ModelInfo};
use crate::detect::features::{extract_packed_features, Features};
use crate::detect::result::{BoundingBox, ModelInput};

/// Deterministic engine for tests and demos.
///
/// Returns the same boxes for every input. `stub://` identities resolve to
/// a single centred box; `stub://empty` resolves to no boxes.
pub struct StubEngine {
    input: ModelInput,
    boxes: Vec<BoundingBox>,
    fail_init: bool,
}

impl StubEngine {
    pub fn new(input: ModelInput, boxes: Vec<BoundingBox>) -> Self {
        Self {
            input,
            boxes,
            fail_init: false,
        }
    }

    /// One box covering the middle quarter of the model input.
    pub fn centered(input: ModelInput) -> Self {
        let (w, h) = (input.width / 4, input.height / 4);
        let bb = BoundingBox::new(
            "object",
            0.9,
            input.width / 2 - w / 2,
            input.height / 2 - h / 2,
            w,
            h,
        );
        Self::new(input, vec![bb])
    }

    pub fn empty(input: ModelInput) -> Self {
        Self::new(input, Vec::new())
    }

    /// Engine whose `init` fails, for exercising worker start-up errors.
    pub fn failing_init(input: ModelInput) -> Self {
        Self {
            fail_init: true,
            ..Self::empty(input)
        }
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn init(&mut self) -> Result<ModelInfo> {
        if self.fail_init {
            return Err(anyhow!("stub engine configured to fail init"));
        }
        let mut labels: Vec<String> = self.boxes.iter().map(|b| b.label.clone()).collect();
        labels.dedup();
        Ok(ModelInfo {
            input: self.input,
            labels,
            version: "stub".to_string(),
        })
    }

    fn extract_features(&mut self, frame: &RgbImage) -> Result<Features> {
        extract_packed_features(frame, self.input)
    }

    fn classify(&mut self, features: &Features) -> Result<Vec<BoundingBox>> {
        if features.input != self.input {
            return Err(anyhow!("features do not match stub model input"));
        }
        Ok(self.boxes.clone())
    }
}
