use crate::align::FaceAligner;
use crate::codec::{self, ImagePayload};
use crate::config::EngineConfig;
use crate::error::{ConfigError, InferenceError, PipelineError};
use crate::inference;
use crate::materialize::to_raster;
use crate::model::GenerativeModel;
use crate::normalize::FaceNormalizer;
use crate::preprocess::{RawTargetAge, encode_age, to_tensor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Stages a request passes through, in their fixed order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Received,
    Decoded,
    Normalized,
    Preprocessed,
    Inferred,
    Materialized,
    Encoded,
    Responded,
}

impl PipelineStage {
    /// Returns the stage as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Received => "received",
            PipelineStage::Decoded => "decoded",
            PipelineStage::Normalized => "normalized",
            PipelineStage::Preprocessed => "preprocessed",
            PipelineStage::Inferred => "inferred",
            PipelineStage::Materialized => "materialized",
            PipelineStage::Encoded => "encoded",
            PipelineStage::Responded => "responded",
        }
    }
}

/// Body of a `transform_age` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub image: ImagePayload,
    #[serde(rename = "targetAge")]
    pub target_age: RawTargetAge,
}

/// Result envelope returned for every request.
///
/// Exactly one of `transformed_image` and `error` is set, matching `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transformed_image: Option<ImagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(image: ImagePayload) -> Self {
        Self {
            success: true,
            transformed_image: Some(image),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            transformed_image: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn transformed_image(&self) -> Option<&ImagePayload> {
        self.transformed_image.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Liveness indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }

    pub fn loading() -> Self {
        Self {
            status: "loading".to_string(),
        }
    }
}

/// A failed request together with the last stage it completed.
#[derive(Error, Debug)]
#[error("{error} (after stage {})", .stage.as_str())]
pub struct StageError {
    pub stage: PipelineStage,
    #[source]
    pub error: PipelineError,
}

/// Turns uploaded photos into age-transformed photos.
///
/// The engine is the explicit context shared by all requests: it owns the generative
/// model and the face normalizer, is built once, and is only ever borrowed immutably
/// afterwards. Wrap it in an `Arc` to serve concurrent requests.
pub struct AgeTransformEngine<M: GenerativeModel, A: FaceAligner> {
    model: M,
    normalizer: FaceNormalizer<A>,
    config: EngineConfig,
    id_counter: AtomicU64,
}

impl<M: GenerativeModel, A: FaceAligner> AgeTransformEngine<M, A> {
    /// Creates an engine around a loaded model.
    ///
    /// The normalizer works at the model's input size, so the alignment crop always
    /// matches what the model expects.
    pub fn new(model: M, aligner: A, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let normalizer = FaceNormalizer::new(aligner, model.input_size());
        Ok(Self {
            model,
            normalizer,
            config,
            id_counter: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Returns the liveness indicator. An engine only exists once its model is loaded.
    pub fn health(&self) -> HealthStatus {
        HealthStatus::healthy()
    }

    /// Handles one request, converting every failure into a failure envelope.
    pub fn transform(&self, request: &TransformRequest) -> ResponseEnvelope {
        match self.try_transform(&request.image, &request.target_age) {
            Ok(image) => ResponseEnvelope::success(image),
            Err(err) => ResponseEnvelope::failure(err.error.public_message()),
        }
    }

    /// Runs the pipeline for one request.
    ///
    /// The error names the last stage the request completed before failing.
    pub fn try_transform(
        &self,
        image: &ImagePayload,
        target_age: &RawTargetAge,
    ) -> Result<ImagePayload, StageError> {
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let start_time = Instant::now();
        let mut stage = PipelineStage::Received;

        match self.run_stages(image, target_age, &mut stage) {
            Ok(payload) => {
                log::info!(
                    "Request {id} {} in {:?}",
                    PipelineStage::Responded.as_str(),
                    start_time.elapsed()
                );
                Ok(payload)
            }
            Err(error) => {
                if error.is_client_error() {
                    log::warn!("Request {id} rejected after {}: {error}", stage.as_str());
                } else {
                    log::error!("Request {id} failed after {}: {error:?}", stage.as_str());
                }
                Err(StageError { stage, error })
            }
        }
    }

    fn run_stages(
        &self,
        image: &ImagePayload,
        target_age: &RawTargetAge,
        stage: &mut PipelineStage,
    ) -> Result<ImagePayload, PipelineError> {
        let raster = codec::decode(image)?;
        *stage = PipelineStage::Decoded;
        log::debug!("Decoded {}x{} image", raster.width(), raster.height());

        // Reject bad ages before alignment or any tensor work.
        let signal = encode_age(
            target_age,
            self.model.protocol(),
            self.config.min_age..=self.config.max_age,
        )?;

        let normalized = self.normalizer.normalize(&raster);
        *stage = PipelineStage::Normalized;

        let tensor = to_tensor(&normalized, self.normalizer.size());
        *stage = PipelineStage::Preprocessed;

        let output = inference::run(&self.model, tensor, signal)?;
        *stage = PipelineStage::Inferred;

        let result = to_raster(&output).map_err(InferenceError::from)?;
        *stage = PipelineStage::Materialized;

        let payload = codec::encode(&result, self.config.jpeg_quality)?;
        *stage = PipelineStage::Encoded;

        Ok(payload)
    }
}
