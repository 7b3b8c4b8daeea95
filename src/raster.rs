use image::{RgbImage, imageops::FilterType};

/// An 8-bit, 3-channel RGB pixel grid.
pub type RasterImage = RgbImage;

/// Resizes `image` to a `size`x`size` square with bilinear filtering.
///
/// An image that already has the requested size is returned as an unchanged copy.
pub fn resize_square(image: &RasterImage, size: u32) -> RasterImage {
    if image.width() == size && image.height() == size {
        return image.clone();
    }
    image::imageops::resize(image, size, size, FilterType::Triangle)
}

/// Standard deviation of the Rec. 601 luma over all pixels.
pub(crate) fn luma_std(image: &RasterImage) -> f32 {
    let count = (image.width() as usize) * (image.height() as usize);
    if count == 0 {
        return 0.0;
    }

    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0;
        let luma = 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
        sum += luma;
        sum_sq += luma * luma;
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    variance.sqrt() as f32
}
