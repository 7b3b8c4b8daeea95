use crate::error::MaterializeError;
use crate::raster::RasterImage;
use ndarray::Array3;

/// One CHW image produced by the model, nominally in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor(Array3<f32>);

impl OutputTensor {
    pub fn new(array: Array3<f32>) -> Self {
        Self(array)
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.0
    }
}

/// Converts a model output back into an 8-bit RGB raster.
///
/// Values are mapped from `[-1, 1]` to `[0, 255]`, clamped and rounded. Non-finite values
/// become 0.
pub fn to_raster(output: &OutputTensor) -> Result<RasterImage, MaterializeError> {
    let (channels, height, width) = output.0.dim();
    if channels != 3 {
        return Err(MaterializeError::Channels(channels));
    }
    if height == 0 || width == 0 {
        return Err(MaterializeError::Empty { height, width });
    }

    Ok(RasterImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            denormalize(output.0[[0, y, x]]),
            denormalize(output.0[[1, y, x]]),
            denormalize(output.0[[2, y, x]]),
        ])
    }))
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    let unit = ((value + 1.0) / 2.0).clamp(0.0, 1.0);
    (unit * 255.0).round() as u8
}
