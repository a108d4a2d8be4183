use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_text_mut};
use std::path::Path;

use crate::detect::{BoundingBox, DetectionResult, ModelInput};

pub const MARKER_RADIUS: i32 = 10;
pub const LABEL_FONT_PX: f32 = 24.0;
const LABEL_OFFSET: i32 = 10;
const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Map a model-space coordinate into frame space.
pub fn remap(value: f64, scale: f64) -> f64 {
    value * scale
}

/// Per-axis scale from model input space to frame space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scale {
    pub x: f64,
    pub y: f64,
}

impl Scale {
    pub fn between(frame_width: u32, frame_height: u32, input: ModelInput) -> Self {
        Self {
            x: frame_width as f64 / input.width.max(1) as f64,
            y: frame_height as f64 / input.height.max(1) as f64,
        }
    }
}

/// Detection mapped into frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct MappedBox {
    pub label: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl MappedBox {
    pub fn map(bb: &BoundingBox, scale: Scale) -> Self {
        Self {
            label: bb.label.clone(),
            confidence: bb.confidence,
            x: remap(bb.x as f64, scale.x) as i32,
            y: remap(bb.y as f64, scale.y) as i32,
            width: remap(bb.width as f64, scale.x) as i32,
            height: remap(bb.height as f64, scale.y) as i32,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn caption(&self) -> String {
        format!("{} ({:.2})", self.label, self.confidence)
    }
}

/// Draws detection markers onto frames.
///
/// Each box above the display threshold gets a filled circle at its centre
/// and, when a font is loaded, a `label (confidence)` caption above it.
pub struct Annotator {
    display_threshold: f32,
    font: Option<FontArc>,
    font_scale: PxScale,
}

impl Annotator {
    pub fn new(display_threshold: f32) -> Self {
        Self {
            display_threshold,
            font: None,
            font_scale: PxScale::from(LABEL_FONT_PX),
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Load a TrueType/OpenType font for captions.
    pub fn load_font(path: &Path) -> Result<FontArc> {
        let data = std::fs::read(path)
            .with_context(|| format!("read label font {}", path.display()))?;
        FontArc::try_from_vec(data)
            .map_err(|err| anyhow!("invalid label font {}: {}", path.display(), err))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Boxes of `result` that pass the display threshold, in frame space.
    pub fn map_boxes(
        &self,
        result: &DetectionResult,
        frame_width: u32,
        frame_height: u32,
    ) -> Vec<MappedBox> {
        let scale = Scale::between(frame_width, frame_height, result.input);
        result
            .boxes
            .iter()
            .filter(|bb| bb.confidence >= self.display_threshold)
            .map(|bb| MappedBox::map(bb, scale))
            .collect()
    }

    /// Draw `result` onto `image`. Returns the number of markers drawn.
    pub fn annotate(&self, image: &mut RgbImage, result: &DetectionResult) -> usize {
        let boxes = self.map_boxes(result, image.width(), image.height());
        for mapped in &boxes {
            draw_filled_circle_mut(image, mapped.center(), MARKER_RADIUS, MARKER_COLOR);
            if let Some(font) = &self.font {
                let text_y = (mapped.y - LABEL_OFFSET - LABEL_FONT_PX as i32).max(0);
                draw_text_mut(
                    image,
                    MARKER_COLOR,
                    mapped.x.max(0),
                    text_y,
                    self.font_scale,
                    font,
                    &mapped.caption(),
                );
            }
        }
        boxes.len()
    }
}
