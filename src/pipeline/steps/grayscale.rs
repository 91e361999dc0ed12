use crate::error::RecognitionError;
use image::DynamicImage;

/// Convert a page to grayscale
/// This is the foundation for the other enhancement steps
pub fn apply(image: DynamicImage) -> Result<DynamicImage, RecognitionError> {
    Ok(DynamicImage::ImageLuma8(image.to_luma8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn converts_color_channels() {
        let mut img = RgbImage::new(10, 10);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        img.put_pixel(2, 0, Rgb([0, 0, 255]));

        let result = apply(DynamicImage::ImageRgb8(img)).unwrap();
        let gray = result.to_luma8();

        assert!(gray.get_pixel(0, 0).0[0] > 0);
        assert!(gray.get_pixel(1, 0).0[0] > 0);
        assert!(gray.get_pixel(2, 0).0[0] > 0);
    }

    #[test]
    fn preserves_dimensions() {
        let img = RgbImage::new(100, 50);
        let result = apply(DynamicImage::ImageRgb8(img)).unwrap();
        assert_eq!(result.width(), 100);
        assert_eq!(result.height(), 50);
    }
}
