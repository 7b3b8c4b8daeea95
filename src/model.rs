//! The generative model contract and its ONNX Runtime implementation.

use crate::error::ModelError;
use crate::preprocess::ConditioningProtocol;
use ndarray::{Array1, Array4};
use ort::logging::LogLevel;
use ort::session::Session;
use ort::value::{Tensor, ValueType};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// Metadata key holding the serialized checkpoint options.
pub const OPTIONS_METADATA_KEY: &str = "opts";

/// Where the model's forward pass executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| format!("unknown device {s:?}, expected cpu, cuda or cuda:<id>")),
        }
    }
}

/// A fully assembled model input: the image tensor combined with the age conditioning.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    /// `(1, 3, S, S)` image and a `(1,)` age scalar.
    Scalar { image: Array4<f32>, age: Array1<f32> },
    /// `(1, 4, S, S)` image whose last channel holds the age.
    AgeChannel { image: Array4<f32> },
}

impl ModelInput {
    pub fn image(&self) -> &Array4<f32> {
        match self {
            ModelInput::Scalar { image, .. } | ModelInput::AgeChannel { image } => image,
        }
    }
}

/// An image-to-image network conditioned on a target age.
///
/// Implementations are loaded once and shared read-only between requests: `generate`
/// takes `&self` and must not change the model's weights.
pub trait GenerativeModel: Send + Sync {
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The conditioning protocol this model was trained with.
    fn protocol(&self) -> ConditioningProtocol;

    /// Side length of the square input image.
    fn input_size(&self) -> u32;

    /// Device the forward pass runs on.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Runs the forward pass and returns the output batch as `(N, 3, H, W)`.
    fn generate(&self, input: ModelInput) -> Result<Array4<f32>, Self::Error>;
}

fn default_input_size() -> u32 {
    256
}

/// Architecture options stored alongside the trained weights.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointOptions {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Number of image input channels; 4 means the age travels as an extra channel.
    #[serde(default)]
    pub input_nc: Option<usize>,
    /// Explicit conditioning protocol, overriding the one implied by `input_nc`.
    #[serde(default)]
    pub conditioning: Option<ConditioningProtocol>,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            input_nc: None,
            conditioning: None,
        }
    }
}

impl CheckpointOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Resolves the conditioning protocol.
    ///
    /// Precedence: explicit `conditioning`, then `input_nc`, then the number of graph
    /// inputs (two inputs carry a separate age scalar).
    pub fn protocol(&self, graph_inputs: usize) -> Result<ConditioningProtocol, String> {
        let from_channels = match self.input_nc {
            Some(3) => Some(ConditioningProtocol::Scalar),
            Some(4) => Some(ConditioningProtocol::AgeChannel),
            Some(n) => return Err(format!("unsupported input_nc {n}")),
            None => None,
        };

        let protocol = match (self.conditioning, from_channels) {
            (Some(explicit), Some(implied)) if explicit != implied => {
                return Err(format!(
                    "conditioning {} contradicts input_nc {:?}",
                    explicit.as_str(),
                    self.input_nc
                ));
            }
            (Some(explicit), _) => explicit,
            (None, Some(implied)) => implied,
            (None, None) if graph_inputs >= 2 => ConditioningProtocol::Scalar,
            (None, None) => ConditioningProtocol::AgeChannel,
        };

        let expected_inputs = match protocol {
            ConditioningProtocol::Scalar => 2,
            ConditioningProtocol::AgeChannel => 1,
        };
        if graph_inputs != expected_inputs {
            return Err(format!(
                "{} conditioning needs {expected_inputs} graph inputs, model has {graph_inputs}",
                protocol.as_str()
            ));
        }
        Ok(protocol)
    }

    /// Checks the declared `(N, C, H, W)` image input against the resolved protocol and
    /// the configured input size. Dynamic dimensions (non-positive) match anything.
    pub fn check_image_input(
        &self,
        protocol: ConditioningProtocol,
        dims: &[i64],
    ) -> Result<(), String> {
        let &[_, channels, height, width] = dims else {
            return Err(format!("image input must be 4D, model declares {dims:?}"));
        };
        let expected_channels = protocol.image_channels() as i64;
        if channels > 0 && channels != expected_channels {
            return Err(format!(
                "{} conditioning needs {expected_channels} image channels, model declares {channels}",
                protocol.as_str()
            ));
        }
        let size = i64::from(self.input_size);
        for (name, dim) in [("height", height), ("width", width)] {
            if dim > 0 && dim != size {
                return Err(format!(
                    "input_size is {size} but the model's image {name} is {dim}"
                ));
            }
        }
        Ok(())
    }
}

/// Builds an ONNX Runtime session placed on `device`.
pub(crate) fn load_session(path: &Path, device: Device) -> Result<Session, ModelError> {
    let session_err = |source: ort::Error| ModelError::Session {
        path: path.to_path_buf(),
        source,
    };

    let builder = Session::builder()
        .and_then(|b| b.with_log_level(LogLevel::Error))
        .map_err(session_err)?;

    let builder = match device {
        Device::Cpu => builder,
        #[cfg(feature = "cuda")]
        Device::Cuda(id) => builder
            .with_execution_providers([ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(id)
                .build()])
            .map_err(session_err)?,
        #[cfg(not(feature = "cuda"))]
        Device::Cuda(_) => return Err(ModelError::DeviceUnavailable(device.to_string())),
    };

    builder.commit_from_file(path).map_err(session_err)
}

/// Declared shape of a session input, with dynamic dimensions as non-positive values.
pub(crate) fn input_dims(session: &Session, index: usize) -> Option<Vec<i64>> {
    match &session.inputs.get(index)?.input_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

/// Locks a session, recovering it when an earlier holder panicked.
///
/// A session holds no state across runs, so a poisoned lock is still usable.
pub(crate) fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(|poisoned| {
        log::warn!("Recovering an inference session poisoned by a panicked run");
        poisoned.into_inner()
    })
}

/// The process-wide generative model handle backed by ONNX Runtime.
///
/// The checkpoint options are read from the model file's custom metadata under
/// [`OPTIONS_METADATA_KEY`] and take precedence over the defaults. ONNX Runtime executes
/// inference only; the session keeps no gradient state. Forward passes are serialized on
/// the session lock.
pub struct OnnxAgeModel {
    session: Mutex<Session>,
    options: CheckpointOptions,
    protocol: ConditioningProtocol,
    device: Device,
}

impl OnnxAgeModel {
    pub fn load(model_path: impl AsRef<Path>, device: Device) -> Result<Self, ModelError> {
        let path = model_path.as_ref();
        let session = load_session(path, device)?;

        let options = match read_options(&session)? {
            Some(text) => {
                CheckpointOptions::from_json(&text).map_err(|source| ModelError::Options {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => {
                log::warn!(
                    "{} has no '{OPTIONS_METADATA_KEY}' metadata, using default options",
                    path.display()
                );
                CheckpointOptions::default()
            }
        };

        let contract_err = |reason| ModelError::Contract {
            path: path.to_path_buf(),
            reason,
        };
        let protocol = options
            .protocol(session.inputs.len())
            .map_err(contract_err)?;
        let dims = input_dims(&session, 0)
            .ok_or_else(|| contract_err("first graph input is not a tensor".to_string()))?;
        options
            .check_image_input(protocol, &dims)
            .map_err(contract_err)?;

        log::info!(
            "Loaded age model from {} on {device} ({} conditioning, {}px input)",
            path.display(),
            protocol.as_str(),
            options.input_size,
        );

        Ok(Self {
            session: Mutex::new(session),
            options,
            protocol,
            device,
        })
    }

    pub fn options(&self) -> &CheckpointOptions {
        &self.options
    }
}

fn read_options(session: &Session) -> Result<Option<String>, ModelError> {
    let metadata = session.metadata()?;
    Ok(metadata.custom(OPTIONS_METADATA_KEY)?)
}

impl GenerativeModel for OnnxAgeModel {
    type Error = ModelError;

    fn protocol(&self) -> ConditioningProtocol {
        self.protocol
    }

    fn input_size(&self) -> u32 {
        self.options.input_size
    }

    fn device(&self) -> Device {
        self.device
    }

    fn generate(&self, input: ModelInput) -> Result<Array4<f32>, Self::Error> {
        let mut session = lock_session(&self.session);

        let outputs = match input {
            ModelInput::Scalar { image, age } => {
                let image = Tensor::from_array(image)?;
                let age = Tensor::from_array(age)?;
                session.run(ort::inputs![image, age])?
            }
            ModelInput::AgeChannel { image } => {
                let image = Tensor::from_array(image)?;
                session.run(ort::inputs![image])?
            }
        };

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| ModelError::Output("model produced no output".to_string()))?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let &[n, c, h, w] = dims.as_slice() else {
            return Err(ModelError::Output(format!(
                "expected a 4D output, got shape {dims:?}"
            )));
        };

        Array4::from_shape_vec((n, c, h, w), data.to_vec())
            .map_err(|e| ModelError::Output(format!("output reshape failed: {e}")))
    }
}
