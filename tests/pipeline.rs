use image::Rgb;
use kornia_agetransform::{
    AgeTransformEngine, AlignmentFailure, ConditioningProtocol, DisabledAligner, EngineConfig,
    FaceAligner, GenerativeModel, ImagePayload, LandmarkAligner, LandmarkDetector, Landmarks,
    ModelInput, PipelineError, PipelineStage, RasterImage, RawTargetAge, TransformRequest, codec,
};
use ndarray::{Array4, s};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const SIZE: u32 = 64;

/// Darkens the input image in proportion to the requested age.
struct FakeModel {
    protocol: ConditioningProtocol,
    calls: AtomicUsize,
    fail: bool,
}

impl FakeModel {
    fn new(protocol: ConditioningProtocol) -> Self {
        Self {
            protocol,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(ConditioningProtocol::Scalar)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GenerativeModel for FakeModel {
    type Error = std::io::Error;

    fn protocol(&self) -> ConditioningProtocol {
        self.protocol
    }

    fn input_size(&self) -> u32 {
        SIZE
    }

    fn generate(&self, input: ModelInput) -> Result<Array4<f32>, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(std::io::Error::other("device out of memory at 0xdeadbeef"));
        }
        let age = match &input {
            ModelInput::Scalar { age, .. } => age[0],
            ModelInput::AgeChannel { image } => image[[0, 3, 0, 0]],
        };
        let image = input.image().slice(s![.., ..3, .., ..]).to_owned();
        Ok(image.mapv(|v| (v - age).max(-1.0)))
    }
}

/// Counts calls and always fails.
#[derive(Default)]
struct CountingAligner(AtomicUsize);

impl FaceAligner for CountingAligner {
    fn align(&self, _image: &RasterImage, _size: u32) -> Result<RasterImage, AlignmentFailure> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(AlignmentFailure::NoFace)
    }
}

impl FaceAligner for &CountingAligner {
    fn align(&self, image: &RasterImage, size: u32) -> Result<RasterImage, AlignmentFailure> {
        (**self).align(image, size)
    }
}

/// Reports a face in the image centre with a fixed confidence, whatever the content.
struct CentreDetector(f32);

impl LandmarkDetector for CentreDetector {
    fn detect(&self, image: &RasterImage) -> Result<Landmarks, AlignmentFailure> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        let mut points = vec![[w * 0.5, h * 0.6]; 68];
        for p in &mut points[36..42] {
            *p = [w * 0.4, h * 0.4];
        }
        for p in &mut points[42..48] {
            *p = [w * 0.6, h * 0.4];
        }
        points[48] = [w * 0.45, h * 0.7];
        points[54] = [w * 0.55, h * 0.7];
        Landmarks::new(points, self.0)
    }
}

fn textured(width: u32, height: u32) -> RasterImage {
    RasterImage::from_fn(width, height, |x, y| {
        Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x * y) % 256) as u8])
    })
}

fn payload(image: &RasterImage) -> ImagePayload {
    codec::encode(image, 95).unwrap()
}

fn engine<A: FaceAligner>(
    model: FakeModel,
    aligner: A,
) -> AgeTransformEngine<FakeModel, A> {
    AgeTransformEngine::new(model, aligner, EngineConfig::default()).unwrap()
}

#[test]
fn test_valid_request_succeeds() {
    let engine = engine(
        FakeModel::new(ConditioningProtocol::Scalar),
        LandmarkAligner::new(CentreDetector(0.9), &EngineConfig::default()),
    );
    let request = TransformRequest {
        image: payload(&textured(200, 150)),
        target_age: RawTargetAge::Integer(60),
    };

    let envelope = engine.transform(&request);
    assert!(envelope.is_success(), "{:?}", envelope.error());
    assert!(envelope.error().is_none());

    let result = codec::decode(envelope.transformed_image().unwrap()).unwrap();
    assert_eq!(result.dimensions(), (SIZE, SIZE));
    assert_eq!(engine.model().calls(), 1);
}

#[test]
fn test_age_channel_protocol() {
    let engine = engine(FakeModel::new(ConditioningProtocol::AgeChannel), DisabledAligner);
    let image = payload(&textured(80, 80));
    let result = engine.try_transform(&image, &RawTargetAge::Text("30".into()));
    assert!(result.is_ok());
}

#[test]
fn test_alignment_failure_falls_back_to_resize() {
    // a solid image has no detectable face
    let engine = engine(
        FakeModel::new(ConditioningProtocol::Scalar),
        LandmarkAligner::new(CentreDetector(0.9), &EngineConfig::default()),
    );
    let solid = RasterImage::from_pixel(120, 90, Rgb([255, 255, 255]));

    let output = engine
        .try_transform(&payload(&solid), &RawTargetAge::Integer(0))
        .unwrap();
    let result = codec::decode(&output).unwrap();
    assert_eq!(result.dimensions(), (SIZE, SIZE));

    // age 0 leaves the white image untouched
    let centre = result.get_pixel(SIZE / 2, SIZE / 2);
    assert!(centre.0.iter().all(|c| *c > 245), "{centre:?}");
}

#[test]
fn test_low_face_score_falls_back_to_resize() {
    let unsure = engine(
        FakeModel::new(ConditioningProtocol::Scalar),
        LandmarkAligner::new(CentreDetector(0.1), &EngineConfig::default()),
    );
    let resize_only = engine(FakeModel::new(ConditioningProtocol::Scalar), DisabledAligner);
    let image = payload(&textured(200, 150));
    let age = RawTargetAge::Integer(30);

    let fallback = unsure.try_transform(&image, &age).unwrap();
    assert_eq!(fallback, resize_only.try_transform(&image, &age).unwrap());

    let confident = engine(
        FakeModel::new(ConditioningProtocol::Scalar),
        LandmarkAligner::new(CentreDetector(0.9), &EngineConfig::default()),
    );
    assert_ne!(confident.try_transform(&image, &age).unwrap(), fallback);
}

#[test]
fn test_out_of_range_age_never_reaches_model() {
    let aligner = CountingAligner::default();
    let engine = engine(FakeModel::new(ConditioningProtocol::Scalar), &aligner);
    let image = payload(&textured(64, 64));

    for age in [-5, 500] {
        let err = engine
            .try_transform(&image, &RawTargetAge::Integer(age))
            .unwrap_err();
        assert!(matches!(err.error, PipelineError::Validation(_)));
        assert!(err.error.is_client_error());

        let envelope = engine.transform(&TransformRequest {
            image: image.clone(),
            target_age: RawTargetAge::Integer(age),
        });
        assert!(!envelope.is_success());
        assert!(envelope.transformed_image().is_none());
        assert!(envelope.error().unwrap().contains("outside the accepted range"));
    }

    assert_eq!(engine.model().calls(), 0);
    assert_eq!(aligner.0.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalid_payload_fails_at_decode() {
    let aligner = CountingAligner::default();
    let engine = engine(FakeModel::new(ConditioningProtocol::Scalar), &aligner);

    let err = engine
        .try_transform(&ImagePayload::new("not-an-image"), &RawTargetAge::Integer(500))
        .unwrap_err();
    assert_eq!(err.stage, PipelineStage::Received);
    assert!(matches!(err.error, PipelineError::Decode(_)));

    assert_eq!(engine.model().calls(), 0);
    assert_eq!(aligner.0.load(Ordering::SeqCst), 0);
}

#[test]
fn test_inference_failure_is_reported_generically() {
    let engine = engine(FakeModel::failing(), DisabledAligner);
    let envelope = engine.transform(&TransformRequest {
        image: payload(&textured(64, 64)),
        target_age: RawTargetAge::Integer(40),
    });
    assert!(!envelope.is_success());
    assert_eq!(envelope.error(), Some("inference failed"));

    let err = engine
        .try_transform(&payload(&textured(64, 64)), &RawTargetAge::Integer(40))
        .unwrap_err();
    assert_eq!(err.stage, PipelineStage::Preprocessed);
    assert!(!err.error.is_client_error());
}

#[test]
fn test_concurrent_requests_are_independent() {
    let engine = Arc::new(engine(
        FakeModel::new(ConditioningProtocol::Scalar),
        DisabledAligner,
    ));

    let inputs = [
        (payload(&RasterImage::from_pixel(64, 64, Rgb([250, 20, 20]))), 10),
        (payload(&textured(90, 70)), 80),
    ];
    let expected: Vec<ImagePayload> = inputs
        .iter()
        .map(|(image, age)| {
            engine
                .try_transform(image, &RawTargetAge::Integer(*age))
                .unwrap()
        })
        .collect();
    assert_ne!(expected[0], expected[1]);

    let results: Vec<ImagePayload> = std::thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|(image, age)| {
                let engine = Arc::clone(&engine);
                scope.spawn(move || {
                    engine
                        .try_transform(image, &RawTargetAge::Integer(*age))
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results, expected);
    assert_eq!(engine.model().calls(), 4);
}

#[test]
fn test_health_is_healthy_once_built() {
    let engine = engine(FakeModel::new(ConditioningProtocol::Scalar), DisabledAligner);
    assert_eq!(engine.health().status, "healthy");
}
