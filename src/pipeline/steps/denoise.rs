use crate::error::RecognitionError;
use image::DynamicImage;
use imageproc::filter::median_filter;

/// Apply a median filter to reduce noise
/// Preserves edges better than Gaussian blur
pub fn apply(image: DynamicImage) -> Result<DynamicImage, RecognitionError> {
    let gray = image.to_luma8();
    // 3x3 median (radius 1) handles salt-and-pepper noise
    let denoised = median_filter(&gray, 1, 1);
    Ok(DynamicImage::ImageLuma8(denoised))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn reduces_salt_pepper_noise() {
        let mut img = GrayImage::from_pixel(10, 10, Luma([128]));
        img.put_pixel(5, 5, Luma([0]));
        img.put_pixel(6, 5, Luma([255]));

        let result = apply(DynamicImage::ImageLuma8(img.clone())).unwrap();
        let result_gray = result.to_luma8();

        let original_variance = variance(&img);
        let result_variance = variance(&result_gray);

        assert!(result_variance <= original_variance);
    }

    fn variance(img: &GrayImage) -> f64 {
        let pixels: Vec<f64> = img.pixels().map(|p| p.0[0] as f64).collect();
        let mean = pixels.iter().sum::<f64>() / pixels.len() as f64;
        pixels.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / pixels.len() as f64
    }
}
