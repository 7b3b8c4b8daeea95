use crate::align::FaceAligner;
use crate::raster::{RasterImage, resize_square};

/// Brings an arbitrary photo to the model's square input geometry.
///
/// Alignment is attempted first; if it fails for any reason the original image is
/// resized instead, so normalization itself never fails.
pub struct FaceNormalizer<A: FaceAligner> {
    aligner: A,
    size: u32,
}

impl<A: FaceAligner> FaceNormalizer<A> {
    pub fn new(aligner: A, size: u32) -> Self {
        Self { aligner, size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn normalize(&self, image: &RasterImage) -> RasterImage {
        match self.aligner.align(image, self.size) {
            Ok(aligned) => resize_square(&aligned, self.size),
            Err(reason) => {
                log::warn!("Face alignment failed ({reason}), falling back to resize");
                resize_square(image, self.size)
            }
        }
    }
}
