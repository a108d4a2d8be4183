use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;

use crate::detect::result::ModelInput;

/// Model input features: one packed value per pixel, row-major.
///
/// RGB pixels are packed as `(r << 16) | (g << 8) | b`. Grayscale models
/// receive the luma value replicated into all three bytes.
#[derive(Clone, Debug)]
pub struct Features {
    pub input: ModelInput,
    pub values: Vec<u32>,
}

/// Squash-resize `frame` to the model input and pack its pixels.
///
/// Squashing keeps per-axis scaling linear so box coordinates map back to
/// the frame with `original / model_input` on each axis.
pub fn extract_packed_features(frame: &RgbImage, input: ModelInput) -> Result<Features> {
    if input.width == 0 || input.height == 0 {
        return Err(anyhow!(
            "model input {}x{} is empty",
            input.width,
            input.height
        ));
    }
    if frame.width() == 0 || frame.height() == 0 {
        return Err(anyhow!("cannot extract features from an empty frame"));
    }

    let resized;
    let view = if frame.dimensions() == (input.width, input.height) {
        frame
    } else {
        resized = image::imageops::resize(frame, input.width, input.height, FilterType::Triangle);
        &resized
    };

    let values = match input.channels {
        3 => view.pixels().map(|p| pack(p[0], p[1], p[2])).collect(),
        1 => view
            .pixels()
            .map(|p| {
                let luma = (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8;
                pack(luma, luma, luma)
            })
            .collect(),
        other => return Err(anyhow!("unsupported model channel count {}", other)),
    };
    Ok(Features { input, values })
}

fn pack(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn packs_rgb_pixels() -> Result<()> {
        let frame = RgbImage::from_pixel(4, 4, Rgb([0x12, 0x34, 0x56]));
        let features = extract_packed_features(&frame, ModelInput::rgb(4, 4))?;
        assert_eq!(features.values.len(), 16);
        assert!(features.values.iter().all(|v| *v == 0x123456));
        Ok(())
    }

    #[test]
    fn resizes_to_model_input() -> Result<()> {
        let frame = RgbImage::from_pixel(96, 54, Rgb([255, 0, 0]));
        let features = extract_packed_features(&frame, ModelInput::rgb(32, 32))?;
        assert_eq!(features.values.len(), 32 * 32);
        assert_eq!(features.values[0], 0xFF0000);
        Ok(())
    }

    #[test]
    fn grayscale_replicates_luma() -> Result<()> {
        let frame = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        let input = ModelInput {
            width: 2,
            height: 2,
            channels: 1,
        };
        let features = extract_packed_features(&frame, input)?;
        assert_eq!(features.values[0], pack(100, 100, 100));
        Ok(())
    }
}
