use crate::error::InferenceError;
use crate::materialize::OutputTensor;
use crate::model::{GenerativeModel, ModelInput};
use crate::preprocess::{ConditioningSignal, InputTensor};
use ndarray::{Array1, Array4, Axis, s};

/// Combines the image tensor with the conditioning signal into a batch of one.
pub fn assemble_input(input: InputTensor, signal: ConditioningSignal) -> ModelInput {
    let image = input.into_array();
    match signal {
        ConditioningSignal::Scalar(age) => ModelInput::Scalar {
            image: image.insert_axis(Axis(0)),
            age: Array1::from_elem(1, age),
        },
        ConditioningSignal::AgeChannel(age) => {
            let (channels, height, width) = image.dim();
            let mut combined = Array4::<f32>::zeros((1, channels + 1, height, width));
            combined.slice_mut(s![0, ..channels, .., ..]).assign(&image);
            combined.slice_mut(s![0, channels, .., ..]).fill(age);
            ModelInput::AgeChannel { image: combined }
        }
    }
}

/// Runs one forward pass and returns the first image of the output batch.
///
/// The inputs are host tensors; the model's backend moves them to its own device. The
/// model is only borrowed immutably, so concurrent calls cannot change its state.
pub fn run<M: GenerativeModel>(
    model: &M,
    input: InputTensor,
    signal: ConditioningSignal,
) -> Result<OutputTensor, InferenceError> {
    if signal.protocol() != model.protocol() {
        return Err(InferenceError::ProtocolMismatch {
            expected: model.protocol().as_str(),
            actual: signal.protocol().as_str(),
        });
    }

    let size = model.input_size() as usize;
    let shape = input.as_array().shape().to_vec();
    if shape != [3, size, size] {
        return Err(InferenceError::ShapeMismatch {
            expected: format!("[3, {size}, {size}]"),
            actual: format!("{shape:?}"),
        });
    }

    log::debug!("Running forward pass on {}", model.device());
    let batch = model
        .generate(assemble_input(input, signal))
        .map_err(|e| InferenceError::Model(Box::new(e)))?;

    let (batch_len, channels, _, _) = batch.dim();
    if batch_len == 0 || channels != 3 {
        return Err(InferenceError::ShapeMismatch {
            expected: "[N >= 1, 3, H, W]".to_string(),
            actual: format!("{:?}", batch.shape()),
        });
    }

    Ok(OutputTensor::new(batch.index_axis_move(Axis(0), 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{ConditioningProtocol, to_tensor};
    use crate::raster::RasterImage;
    use image::Rgb;
    use std::convert::Infallible;

    /// Echoes the first three input channels, shifted by the age.
    struct EchoModel(ConditioningProtocol);

    impl GenerativeModel for EchoModel {
        type Error = Infallible;

        fn protocol(&self) -> ConditioningProtocol {
            self.0
        }

        fn input_size(&self) -> u32 {
            8
        }

        fn generate(&self, input: ModelInput) -> Result<Array4<f32>, Self::Error> {
            let age = match &input {
                ModelInput::Scalar { age, .. } => age[0],
                ModelInput::AgeChannel { image } => image[[0, 3, 0, 0]],
            };
            let echo = input.image().slice(s![.., ..3, .., ..]).to_owned();
            Ok(echo - age)
        }
    }

    fn tensor(size: u32) -> InputTensor {
        to_tensor(&RasterImage::from_pixel(size, size, Rgb([255, 255, 255])), size)
    }

    #[test]
    fn test_assemble_scalar() {
        let input = assemble_input(tensor(8), ConditioningSignal::Scalar(0.4));
        let ModelInput::Scalar { image, age } = input else {
            panic!("expected scalar input");
        };
        assert_eq!(image.shape(), &[1, 3, 8, 8]);
        assert_eq!(age.to_vec(), vec![0.4]);
    }

    #[test]
    fn test_assemble_age_channel() {
        let input = assemble_input(tensor(8), ConditioningSignal::AgeChannel(0.25));
        let image = input.image();
        assert_eq!(image.shape(), &[1, 4, 8, 8]);
        assert!(image.slice(s![0, 3, .., ..]).iter().all(|v| *v == 0.25));
        assert!(image.slice(s![0, ..3, .., ..]).iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_run_returns_first_batch_element() {
        for (protocol, signal) in [
            (ConditioningProtocol::Scalar, ConditioningSignal::Scalar(0.5)),
            (ConditioningProtocol::AgeChannel, ConditioningSignal::AgeChannel(0.5)),
        ] {
            let output = run(&EchoModel(protocol), tensor(8), signal).unwrap();
            assert_eq!(output.as_array().shape(), &[3, 8, 8]);
            assert!(output.as_array().iter().all(|v| (*v - 0.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_run_rejects_protocol_mismatch() {
        let model = EchoModel(ConditioningProtocol::AgeChannel);
        assert!(matches!(
            run(&model, tensor(8), ConditioningSignal::Scalar(0.5)),
            Err(InferenceError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_run_rejects_wrong_input_size() {
        let model = EchoModel(ConditioningProtocol::Scalar);
        assert!(matches!(
            run(&model, tensor(16), ConditioningSignal::Scalar(0.5)),
            Err(InferenceError::ShapeMismatch { .. })
        ));
    }
}
