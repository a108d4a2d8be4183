use serde::{Deserialize, Serialize};

/// Model input geometry. Box coordinates from an engine are in this space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    /// 3 for RGB models, 1 for grayscale.
    pub channels: u32,
}

impl ModelInput {
    pub fn rgb(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 3,
        }
    }
}

impl Default for ModelInput {
    fn default() -> Self {
        Self::rgb(320, 320)
    }
}

/// Box as reported by an engine, before validation.
#[derive(Clone, Debug, Deserialize)]
pub struct RawBoundingBox {
    pub label: String,
    pub value: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Validated detection in model input coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub label: String,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(
        label: impl Into<String>,
        confidence: f32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label: label.into(),
            confidence,
            x,
            y,
            width,
            height,
        }
    }

    /// Validate an engine box against the model input.
    ///
    /// Non-finite values reject the box. Confidence is clamped to `[0, 1]`
    /// and the rectangle is clamped to the model input area.
    pub fn from_raw(raw: &RawBoundingBox, input: ModelInput) -> Option<Self> {
        let values = [raw.value, raw.x, raw.y, raw.width, raw.height];
        if values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let x = raw.x.round().clamp(0.0, input.width as f64) as u32;
        let y = raw.y.round().clamp(0.0, input.height as f64) as u32;
        let width = raw.width.round().clamp(0.0, (input.width - x) as f64) as u32;
        let height = raw.height.round().clamp(0.0, (input.height - y) as f64) as u32;
        Some(Self::new(
            raw.label.clone(),
            raw.value as f32,
            x,
            y,
            width,
            height,
        ))
    }
}

/// Output of one classification pass.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    /// Index of the work item that produced this result.
    pub frame_index: u64,
    /// Coordinate space of `boxes`.
    pub input: ModelInput,
    pub boxes: Vec<BoundingBox>,
}

impl DetectionResult {
    pub fn new(frame_index: u64, input: ModelInput, boxes: Vec<BoundingBox>) -> Self {
        Self {
            frame_index,
            input,
            boxes,
        }
    }
}
