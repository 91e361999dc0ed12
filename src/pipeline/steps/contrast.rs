use crate::error::RecognitionError;
use image::{DynamicImage, GrayImage, Luma};

/// Equalize contrast using histogram stretching
/// Maps pixel values to use the full 0-255 range
pub fn apply(image: DynamicImage) -> Result<DynamicImage, RecognitionError> {
    let gray = image.to_luma8();
    let (min_val, max_val) = find_min_max(&gray);

    // Avoid division by zero on uniform pages
    if max_val <= min_val {
        return Ok(DynamicImage::ImageLuma8(gray));
    }

    let range = (max_val - min_val) as f32;
    let stretched = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let pixel = gray.get_pixel(x, y).0[0];
        let stretched = ((pixel - min_val) as f32 / range * 255.0) as u8;
        Luma([stretched])
    });

    Ok(DynamicImage::ImageLuma8(stretched))
}

fn find_min_max(img: &GrayImage) -> (u8, u8) {
    let mut min = 255u8;
    let mut max = 0u8;

    for pixel in img.pixels() {
        let val = pixel.0[0];
        min = min.min(val);
        max = max.max(val);
    }

    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretches_histogram() {
        // Low-contrast page, values 50-200
        let img = GrayImage::from_fn(10, 10, |x, _| {
            let val = 50 + (x as u8 * 15).min(150);
            Luma([val])
        });

        let result = apply(DynamicImage::ImageLuma8(img)).unwrap();
        let (min, max) = find_min_max(&result.to_luma8());

        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn handles_uniform_page() {
        let img = GrayImage::from_pixel(10, 10, Luma([128]));

        let result = apply(DynamicImage::ImageLuma8(img)).unwrap();

        assert_eq!(result.to_luma8().get_pixel(0, 0).0[0], 128);
    }
}
