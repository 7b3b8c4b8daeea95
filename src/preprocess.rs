//! Raster to tensor conversion and target-age conditioning.

use crate::error::ValidationError;
use crate::raster::{RasterImage, resize_square};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Per-channel mean and standard deviation of the input normalization.
pub const NORMALIZE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const NORMALIZE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Divisor mapping an age in years to the model's conditioning scale.
const AGE_SCALE: f32 = 100.0;

/// A normalized `(3, S, S)` CHW tensor with values in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array3<f32>);

impl InputTensor {
    pub fn as_array(&self) -> &Array3<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array3<f32> {
        self.0
    }

    /// Spatial side length.
    pub fn size(&self) -> usize {
        self.0.shape()[1]
    }
}

/// Converts a raster into the model's input tensor.
///
/// The raster is resized to `size`x`size` (a no-op when it already has that size),
/// scaled to `[0, 1]` and normalized with [`NORMALIZE_MEAN`] / [`NORMALIZE_STD`].
pub fn to_tensor(image: &RasterImage, size: u32) -> InputTensor {
    let resized = resize_square(image, size);
    let side = size as usize;

    let mut tensor = Array3::<f32>::zeros((3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let scaled = f32::from(pixel[c]) / 255.0;
            tensor[[c, y as usize, x as usize]] = (scaled - NORMALIZE_MEAN[c]) / NORMALIZE_STD[c];
        }
    }

    InputTensor(tensor)
}

/// How the target age is presented to the generative model.
///
/// A model supports exactly one protocol; it is fixed when the model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningProtocol {
    /// `age / 100` passed as a second model input of shape `(1,)`.
    Scalar,
    /// A constant channel of value `age / 100` appended to the image tensor.
    AgeChannel,
}

impl ConditioningProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditioningProtocol::Scalar => "scalar",
            ConditioningProtocol::AgeChannel => "age_channel",
        }
    }

    /// Number of channels of the image input under this protocol.
    pub fn image_channels(&self) -> usize {
        match self {
            ConditioningProtocol::Scalar => 3,
            ConditioningProtocol::AgeChannel => 4,
        }
    }
}

/// The age conditioning value in the form the model's protocol requires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConditioningSignal {
    Scalar(f32),
    AgeChannel(f32),
}

impl ConditioningSignal {
    pub fn protocol(&self) -> ConditioningProtocol {
        match self {
            ConditioningSignal::Scalar(_) => ConditioningProtocol::Scalar,
            ConditioningSignal::AgeChannel(_) => ConditioningProtocol::AgeChannel,
        }
    }

    pub fn value(&self) -> f32 {
        match self {
            ConditioningSignal::Scalar(v) | ConditioningSignal::AgeChannel(v) => *v,
        }
    }
}

/// The `targetAge` field as it arrives on the wire: a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTargetAge {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawTargetAge {
    fn as_integer(&self) -> Result<i64, ValidationError> {
        match self {
            RawTargetAge::Integer(age) => Ok(*age),
            RawTargetAge::Float(age) if age.is_finite() && age.fract() == 0.0 => Ok(*age as i64),
            RawTargetAge::Float(age) => Err(ValidationError::NotAnInteger(age.to_string())),
            RawTargetAge::Text(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| ValidationError::NotAnInteger(text.clone())),
        }
    }
}

impl From<i64> for RawTargetAge {
    fn from(age: i64) -> Self {
        RawTargetAge::Integer(age)
    }
}

/// A target age that passed range validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetAge(u32);

impl TargetAge {
    /// Parses and range-checks a raw age. Out-of-range ages are rejected, never clamped.
    pub fn parse(raw: &RawTargetAge, range: RangeInclusive<u32>) -> Result<Self, ValidationError> {
        let age = raw.as_integer()?;
        let out_of_range = || ValidationError::OutOfRange {
            age,
            min: *range.start(),
            max: *range.end(),
        };
        let years = u32::try_from(age).map_err(|_| out_of_range())?;
        if !range.contains(&years) {
            return Err(out_of_range());
        }
        Ok(Self(years))
    }

    pub fn years(&self) -> u32 {
        self.0
    }

    /// The age on the model's `[0, 1]` conditioning scale.
    pub fn normalized(&self) -> f32 {
        self.0 as f32 / AGE_SCALE
    }
}

/// Validates the requested age and encodes it for the given protocol.
pub fn encode_age(
    raw: &RawTargetAge,
    protocol: ConditioningProtocol,
    range: RangeInclusive<u32>,
) -> Result<ConditioningSignal, ValidationError> {
    let age = TargetAge::parse(raw, range)?;
    Ok(match protocol {
        ConditioningProtocol::Scalar => ConditioningSignal::Scalar(age.normalized()),
        ConditioningProtocol::AgeChannel => ConditioningSignal::AgeChannel(age.normalized()),
    })
}
