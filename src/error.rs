//! Error types for the age transformation pipeline.
//!
//! Each pipeline stage owns a small error enum. [`PipelineError`] is the union of the
//! kinds that may reach a caller; [`AlignmentFailure`] never does, it is consumed by the
//! face normalizer.

use std::path::PathBuf;
use thiserror::Error;

/// The image payload could not be turned into a raster image.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload carried no image bytes.
    #[error("image payload is empty")]
    EmptyPayload,

    /// The payload text is not valid base64.
    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The bytes are not a recognizable image format.
    #[error("payload is not a recognizable image: {0}")]
    Image(#[from] image::ImageError),
}

/// The raster image could not be serialized back into a payload.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to encode result image: {0}")]
    Image(#[from] image::ImageError),
}

/// The requested target age was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("target age must be an integer, got {0:?}")]
    NotAnInteger(String),

    #[error("target age {age} is outside the accepted range {min}..={max}")]
    OutOfRange { age: i64, min: u32, max: u32 },
}

/// Reasons the face aligner could not produce a registered crop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentFailure {
    #[error("no face detected")]
    NoFace,

    #[error("degenerate face geometry: {0}")]
    Degenerate(String),

    #[error("landmark detector failed: {0}")]
    Detector(String),

    #[error("no landmark detector configured")]
    Unavailable,
}

/// The model output could not be turned into a raster image.
#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("expected a 3-channel output tensor, got {0} channels")]
    Channels(usize),

    #[error("output tensor has an empty spatial extent {height}x{width}")]
    Empty { height: usize, width: usize },
}

/// Failures during the forward pass.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The conditioning signal does not match the model's conditioning protocol.
    #[error("conditioning protocol mismatch: model expects {expected}, got {actual}")]
    ProtocolMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A tensor did not have the shape the model contract requires.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// The model backend itself failed.
    #[error("model execution failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The output tensor could not be materialized.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

/// Errors raised while loading a model file.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to create ONNX session for {path}: {source}")]
    Session {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    #[error("invalid checkpoint options in {path}: {source}")]
    Options {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("model {path} violates its input contract: {reason}")]
    Contract { path: PathBuf, reason: String },

    #[error("device {0} is unavailable in this build, enable the `cuda` feature")]
    DeviceUnavailable(String),

    #[error("model execution failed: {0}")]
    Run(#[from] ort::Error),

    #[error("unexpected model output: {0}")]
    Output(String),
}

/// The engine configuration is unusable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Every failure that can end a request.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl PipelineError {
    /// Whether the failure is attributable to the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Validation(_))
    }

    /// The message placed in the response envelope.
    ///
    /// Inference failures only report a generic message; their detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Inference(_) => "inference failed".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(PipelineError::from(DecodeError::EmptyPayload).is_client_error());
        assert!(
            PipelineError::from(ValidationError::NotAnInteger("x".into())).is_client_error()
        );
        let shape = InferenceError::ShapeMismatch {
            expected: "(3, 256, 256)".into(),
            actual: "(3, 10, 10)".into(),
        };
        assert!(!PipelineError::from(shape).is_client_error());
    }

    #[test]
    fn test_inference_message_is_generic() {
        let err = PipelineError::from(InferenceError::Model("CUDA out of memory".into()));
        assert_eq!(err.public_message(), "inference failed");
    }

    #[test]
    fn test_validation_message_names_range() {
        let err = PipelineError::from(ValidationError::OutOfRange {
            age: 500,
            min: 0,
            max: 100,
        });
        assert_eq!(
            err.public_message(),
            "target age 500 is outside the accepted range 0..=100"
        );
    }
}
