use crate::error::RecognitionError;
use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// Assume input rasters are 72 DPI when no metadata is available
const ASSUMED_INPUT_DPI: u32 = 72;
/// Minimum dimension for reasonable recognition
const MIN_DIMENSION: u32 = 300;

/// Scale a page toward the target DPI, constrained so its longest edge stays
/// within `max_dimension` (aspect ratio preserved).
pub fn apply(
    image: DynamicImage,
    target_dpi: u32,
    max_dimension: u32,
) -> Result<DynamicImage, RecognitionError> {
    let (width, height) = image.dimensions();

    let scale = target_dpi as f32 / ASSUMED_INPUT_DPI as f32;
    let mut new_width = (width as f32 * scale) as u32;
    let mut new_height = (height as f32 * scale) as u32;

    // Clamp longest edge
    if new_width > max_dimension || new_height > max_dimension {
        let longest = new_width.max(new_height);
        let scale_down = max_dimension as f32 / longest as f32;
        new_width = (new_width as f32 * scale_down) as u32;
        new_height = (new_height as f32 * scale_down) as u32;
    }

    // Ensure minimum dimension
    if new_width < MIN_DIMENSION && new_height < MIN_DIMENSION {
        let shortest = new_width.min(new_height).max(1);
        let scale_up = MIN_DIMENSION as f32 / shortest as f32;
        new_width = (new_width as f32 * scale_up) as u32;
        new_height = (new_height as f32 * scale_up) as u32;
    }

    // Skip resize if dimensions are similar (within 5%)
    let width_ratio = new_width as f32 / width as f32;
    let height_ratio = new_height as f32 / height as f32;
    if (0.95..=1.05).contains(&width_ratio) && (0.95..=1.05).contains(&height_ratio) {
        return Ok(image);
    }

    Ok(image.resize(new_width, new_height, FilterType::Lanczos3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn upscales_small_page() {
        // 100x100 at 72 DPI should scale toward ~416x416 at 300 DPI
        let img = GrayImage::new(100, 100);
        let result = apply(DynamicImage::ImageLuma8(img), 300, 4000).unwrap();
        assert!(result.width() > 100);
        assert!(result.height() > 100);
    }

    #[test]
    fn clamps_longest_edge() {
        let img = GrayImage::new(2000, 1000);
        let result = apply(DynamicImage::ImageLuma8(img), 300, 4000).unwrap();
        assert!(result.width() <= 4000);
        assert!(result.height() <= 4000);
    }

    #[test]
    fn respects_configured_maximum() {
        let img = GrayImage::new(1000, 1000);
        let result = apply(DynamicImage::ImageLuma8(img), 300, 1200).unwrap();
        assert!(result.width() <= 1200);
        assert!(result.height() <= 1200);
    }

    #[test]
    fn preserves_aspect_ratio() {
        let img = GrayImage::new(400, 200);
        let result = apply(DynamicImage::ImageLuma8(img), 300, 4000).unwrap();
        let ratio = result.width() as f32 / result.height() as f32;
        assert!((ratio - 2.0).abs() < 0.05, "ratio drifted to {}", ratio);
    }
}
