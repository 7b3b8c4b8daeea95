//! Age transformation of face photographs.
//!
//! Given an uploaded photo and a target age, the [`AgeTransformEngine`] produces a
//! re-rendering of the depicted face at that age. A request flows through a fixed
//! pipeline:
//!
//! 1. [`codec::decode`] turns the text payload into an RGB raster,
//! 2. the target age is validated and encoded for the model's [`ConditioningProtocol`],
//! 3. [`FaceNormalizer`] aligns the face, falling back to a plain resize,
//! 4. [`preprocess::to_tensor`] produces the normalized input tensor,
//! 5. [`inference::run`] executes the [`GenerativeModel`] forward pass,
//! 6. [`materialize::to_raster`] and [`codec::encode`] turn the output back into a payload.
//!
//! Every failure ends in a [`ResponseEnvelope`] rather than a panic or transport error.
//!
//! The model and the landmark detector are traits; [`OnnxAgeModel`] and
//! [`OnnxLandmarkDetector`] provide ONNX Runtime implementations.

pub mod align;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference;
pub mod materialize;
pub mod model;
pub mod normalize;
pub mod preprocess;
pub mod raster;

pub use align::{
    DisabledAligner, FaceAligner, LandmarkAligner, LandmarkDetector, Landmarks,
    OnnxLandmarkDetector,
};
pub use codec::ImagePayload;
pub use config::EngineConfig;
pub use engine::{
    AgeTransformEngine, HealthStatus, PipelineStage, ResponseEnvelope, StageError,
    TransformRequest,
};
pub use error::{
    AlignmentFailure, ConfigError, DecodeError, EncodeError, InferenceError, ModelError,
    PipelineError, ValidationError,
};
pub use model::{CheckpointOptions, Device, GenerativeModel, ModelInput, OnnxAgeModel};
pub use normalize::FaceNormalizer;
pub use preprocess::{
    ConditioningProtocol, ConditioningSignal, InputTensor, RawTargetAge, TargetAge,
};
pub use raster::RasterImage;
