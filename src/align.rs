//! Landmark-based face alignment.
//!
//! [`LandmarkAligner`] registers a face to the canonical FFHQ crop: it locates 68 facial
//! landmarks, derives an oriented square from the eye and mouth positions, and resamples
//! that square into the pipeline's input resolution.

use crate::config::EngineConfig;
use crate::error::{AlignmentFailure, ModelError};
use crate::model::{Device, input_dims, load_session, lock_session};
use crate::raster::{RasterImage, luma_std, resize_square};
use image::Rgb;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

/// Number of points in the iBUG 68-point landmark scheme.
pub const LANDMARK_COUNT: usize = 68;

/// Input resolution of a landmark model whose input shape is dynamic.
pub const DEFAULT_LANDMARK_INPUT_SIZE: usize = 112;

const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const MOUTH_LEFT: usize = 48;
const MOUTH_RIGHT: usize = 54;

/// Produces a geometrically registered face crop.
pub trait FaceAligner: Send + Sync {
    /// Returns an aligned `size`x`size` crop of the face in `image`.
    fn align(&self, image: &RasterImage, size: u32) -> Result<RasterImage, AlignmentFailure>;
}

impl<T: FaceAligner + ?Sized> FaceAligner for Box<T> {
    fn align(&self, image: &RasterImage, size: u32) -> Result<RasterImage, AlignmentFailure> {
        (**self).align(image, size)
    }
}

/// Locates the 68 facial landmarks of the most prominent face.
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, image: &RasterImage) -> Result<Landmarks, AlignmentFailure>;
}

/// 68 facial landmarks in source pixel coordinates, with the detector's confidence that
/// they belong to a face.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    points: Vec<[f32; 2]>,
    score: f32,
}

impl Landmarks {
    pub fn new(points: Vec<[f32; 2]>, score: f32) -> Result<Self, AlignmentFailure> {
        if points.len() != LANDMARK_COUNT {
            return Err(AlignmentFailure::Detector(format!(
                "expected {LANDMARK_COUNT} landmarks, got {}",
                points.len()
            )));
        }
        if !score.is_finite() || points.iter().flatten().any(|v| !v.is_finite()) {
            return Err(AlignmentFailure::NoFace);
        }
        Ok(Self { points, score })
    }

    pub fn points(&self) -> &[[f32; 2]] {
        &self.points
    }

    /// Face confidence in `[0, 1]`.
    pub fn score(&self) -> f32 {
        self.score
    }

    fn mean(&self, range: std::ops::Range<usize>) -> [f32; 2] {
        let n = range.len() as f32;
        let [sx, sy] = self.points[range]
            .iter()
            .fold([0.0f32, 0.0], |[ax, ay], [x, y]| [ax + x, ay + y]);
        [sx / n, sy / n]
    }
}

/// Oriented square around a face: upper-left, lower-left, lower-right, upper-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceQuad {
    pub corners: [[f32; 2]; 4],
}

impl FaceQuad {
    /// Derives the FFHQ crop square from eye and mouth landmarks.
    pub fn from_landmarks(landmarks: &Landmarks) -> Self {
        let eye_left = landmarks.mean(LEFT_EYE);
        let eye_right = landmarks.mean(RIGHT_EYE);
        let eye_avg = midpoint(eye_left, eye_right);
        let eye_to_eye = sub(eye_right, eye_left);

        let points = landmarks.points();
        let mouth_avg = midpoint(points[MOUTH_LEFT], points[MOUTH_RIGHT]);
        let eye_to_mouth = sub(mouth_avg, eye_avg);

        // x points right along the eye line, tilted by the eye-to-mouth direction.
        let mut x = [eye_to_eye[0] + eye_to_mouth[1], eye_to_eye[1] - eye_to_mouth[0]];
        let len = norm(x);
        let scale = (norm(eye_to_eye) * 2.0).max(norm(eye_to_mouth) * 1.8);
        if len > 0.0 {
            x = [x[0] / len * scale, x[1] / len * scale];
        }
        let y = [-x[1], x[0]];
        let c = [eye_avg[0] + eye_to_mouth[0] * 0.1, eye_avg[1] + eye_to_mouth[1] * 0.1];

        Self {
            corners: [
                [c[0] - x[0] - y[0], c[1] - x[1] - y[1]],
                [c[0] - x[0] + y[0], c[1] - x[1] + y[1]],
                [c[0] + x[0] + y[0], c[1] + x[1] + y[1]],
                [c[0] + x[0] - y[0], c[1] + x[1] - y[1]],
            ],
        }
    }

    /// Side length of the square in source pixels.
    pub fn side(&self) -> f32 {
        norm(sub(self.corners[3], self.corners[0]))
    }

    /// Resamples the quad into a `size`x`size` image.
    ///
    /// Samples falling outside the source are mirrored back into it.
    pub fn warp(&self, image: &RasterImage, size: u32) -> RasterImage {
        let [origin, lower_left, _, upper_right] = self.corners;
        let u_axis = sub(upper_right, origin);
        let v_axis = sub(lower_left, origin);
        let side = size as f32;

        RasterImage::from_fn(size, size, |ox, oy| {
            let u = (ox as f32 + 0.5) / side;
            let v = (oy as f32 + 0.5) / side;
            let sx = origin[0] + u * u_axis[0] + v * v_axis[0] - 0.5;
            let sy = origin[1] + u * u_axis[1] + v * v_axis[1] - 0.5;
            sample_bilinear(image, sx, sy)
        })
    }
}

/// Aligns faces using a [`LandmarkDetector`].
pub struct LandmarkAligner<D: LandmarkDetector> {
    detector: D,
    min_face_size: f32,
    min_face_score: f32,
    uniform_std_threshold: f32,
}

impl<D: LandmarkDetector> LandmarkAligner<D> {
    pub fn new(detector: D, config: &EngineConfig) -> Self {
        Self {
            detector,
            min_face_size: config.min_face_size,
            min_face_score: config.min_face_score,
            uniform_std_threshold: config.uniform_std_threshold,
        }
    }
}

impl<D: LandmarkDetector> FaceAligner for LandmarkAligner<D> {
    fn align(&self, image: &RasterImage, size: u32) -> Result<RasterImage, AlignmentFailure> {
        // A flat image carries no face; skip the detector.
        if luma_std(image) < self.uniform_std_threshold {
            return Err(AlignmentFailure::NoFace);
        }

        let landmarks = self.detector.detect(image)?;
        if landmarks.score() < self.min_face_score {
            log::debug!(
                "Face score {:.2} is below {:.2}",
                landmarks.score(),
                self.min_face_score
            );
            return Err(AlignmentFailure::NoFace);
        }

        let quad = FaceQuad::from_landmarks(&landmarks);
        let side = quad.side();
        if !side.is_finite() || side < self.min_face_size {
            return Err(AlignmentFailure::Degenerate(format!(
                "face square side {side:.1}px is below {:.1}px",
                self.min_face_size
            )));
        }

        log::debug!("Aligned face square of side {side:.1}px");
        Ok(quad.warp(image, size))
    }
}

/// Aligner used when no landmark model is configured; always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAligner;

impl FaceAligner for DisabledAligner {
    fn align(&self, _image: &RasterImage, _size: u32) -> Result<RasterImage, AlignmentFailure> {
        Err(AlignmentFailure::Unavailable)
    }
}

/// A 68-point landmark regressor exported to ONNX.
///
/// The model takes a `(1, 3, N, N)` RGB tensor in `[0, 1]`, N read from its input shape.
/// It has two outputs: at least 136 values holding `(x, y)` pairs normalized to the input
/// image, then the face confidence in `[0, 1]`.
pub struct OnnxLandmarkDetector {
    session: Mutex<Session>,
    input_size: usize,
}

impl OnnxLandmarkDetector {
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = model_path.as_ref();
        let session = load_session(path, Device::Cpu)?;

        let contract_err = |reason| ModelError::Contract {
            path: path.to_path_buf(),
            reason,
        };
        let dims = input_dims(&session, 0)
            .ok_or_else(|| contract_err("first graph input is not a tensor".to_string()))?;
        let input_size = landmark_input_size(&dims).map_err(contract_err)?;
        if session.outputs.len() < 2 {
            return Err(contract_err(format!(
                "expected landmark and face score outputs, model has {}",
                session.outputs.len()
            )));
        }

        log::info!(
            "Loaded landmark model from {} ({input_size}px input)",
            path.display()
        );
        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    fn input_tensor(&self, image: &RasterImage) -> Array4<f32> {
        let resized = resize_square(image, self.input_size as u32);
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_size, self.input_size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
            }
        }
        tensor
    }
}

impl LandmarkDetector for OnnxLandmarkDetector {
    fn detect(&self, image: &RasterImage) -> Result<Landmarks, AlignmentFailure> {
        let detector_err = |e: ort::Error| AlignmentFailure::Detector(e.to_string());
        let missing =
            |what: &str| AlignmentFailure::Detector(format!("landmark model has no {what}"));

        let input = Tensor::from_array(self.input_tensor(image)).map_err(detector_err)?;
        let mut session = lock_session(&self.session);
        let outputs = session.run(ort::inputs![input]).map_err(detector_err)?;
        let mut values = outputs.values();
        let landmarks = values.next().ok_or_else(|| missing("landmark output"))?;
        let score = values.next().ok_or_else(|| missing("face score output"))?;
        let (_, data) = landmarks.try_extract_tensor::<f32>().map_err(detector_err)?;
        let (_, score) = score.try_extract_tensor::<f32>().map_err(detector_err)?;
        let score = *score.first().ok_or_else(|| missing("face score"))?;

        if data.len() < LANDMARK_COUNT * 2 {
            return Err(AlignmentFailure::Detector(format!(
                "expected {} landmark values, got {}",
                LANDMARK_COUNT * 2,
                data.len()
            )));
        }

        let (width, height) = (image.width() as f32, image.height() as f32);
        let points = data[..LANDMARK_COUNT * 2]
            .chunks_exact(2)
            .map(|p| [p[0] * width, p[1] * height])
            .collect();
        Landmarks::new(points, score)
    }
}

/// Square input resolution declared by a `(1, 3, N, N)` landmark model input.
fn landmark_input_size(dims: &[i64]) -> Result<usize, String> {
    let &[_, channels, height, width] = dims else {
        return Err(format!("landmark input must be 4D, model declares {dims:?}"));
    };
    if channels > 0 && channels != 3 {
        return Err(format!("landmark input needs 3 channels, model declares {channels}"));
    }
    match (height, width) {
        (h, w) if h > 0 && w > 0 && h != w => {
            Err(format!("landmark input must be square, model declares {h}x{w}"))
        }
        (h, _) if h > 0 => Ok(h as usize),
        (_, w) if w > 0 => Ok(w as usize),
        _ => Ok(DEFAULT_LANDMARK_INPUT_SIZE),
    }
}

fn sub(a: [f32; 2], b: [f32; 2]) -> [f32; 2] {
    [a[0] - b[0], a[1] - b[1]]
}

fn midpoint(a: [f32; 2], b: [f32; 2]) -> [f32; 2] {
    [(a[0] + b[0]) * 0.5, (a[1] + b[1]) * 0.5]
}

fn norm(v: [f32; 2]) -> f32 {
    v[0].hypot(v[1])
}

/// Mirrors an integer coordinate into `0..len`.
fn reflect(index: i64, len: u32) -> u32 {
    let len = i64::from(len);
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let folded = index.rem_euclid(period);
    let mirrored = if folded >= len { period - folded } else { folded };
    mirrored as u32
}

fn sample_bilinear(image: &RasterImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (wx, wy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);
    let (w, h) = image.dimensions();

    let px = |dx: i64, dy: i64| image.get_pixel(reflect(x0 + dx, w), reflect(y0 + dy, h));
    let (p00, p10, p01, p11) = (px(0, 0), px(1, 0), px(0, 1), px(1, 1));

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = f32::from(p00[c]) * (1.0 - wx) + f32::from(p10[c]) * wx;
        let bottom = f32::from(p01[c]) * (1.0 - wx) + f32::from(p11[c]) * wx;
        *value = (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
