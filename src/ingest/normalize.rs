use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;

use crate::frame::FrameShape;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
}

/// Convert a raw device buffer to an RGB image.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Rgb24 => {
            let expected = pixel_count * 3;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            RgbImage::from_raw(width, height, pixels[..expected].to_vec())
                .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height, pixel_count),
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32, pixel_count: usize) -> Result<RgbImage> {
    let expected = pixel_count * 2;
    if width % 2 != 0 || pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {} bytes for {}x{}, got {}",
            expected,
            width,
            height,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in pixels[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0] as f32, quad[2] as f32] {
            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("YUYV conversion produced a short buffer"))
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Resize `image` to `shape` unless it already matches.
pub(crate) fn fit_to_shape(image: RgbImage, shape: FrameShape) -> RgbImage {
    if shape.matches(&image) {
        return image;
    }
    image::imageops::resize(&image, shape.width, shape.height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![128u8, 128, 128, 128];
        let rgb = normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(rgb.as_raw(), &vec![128u8; 6]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() {
        assert!(normalize_to_rgb(&[1u8; 9], 1, 3, PixelFormat::Rgb24).is_ok());
        assert!(normalize_to_rgb(&[1u8; 8], 1, 3, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn fit_to_shape_resizes_only_when_needed() {
        let shape = FrameShape::new(4, 2);
        let same = fit_to_shape(RgbImage::new(4, 2), shape);
        assert_eq!(same.dimensions(), (4, 2));
        let resized = fit_to_shape(RgbImage::new(16, 9), shape);
        assert_eq!(resized.dimensions(), (4, 2));
    }
}
