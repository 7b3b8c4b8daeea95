use argh::FromArgs;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use kornia_agetransform::{
    AgeTransformEngine, Device, DisabledAligner, EngineConfig, FaceAligner, HealthStatus,
    LandmarkAligner, OnnxAgeModel, OnnxLandmarkDetector, ResponseEnvelope, TransformRequest,
};
use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

type Engine = AgeTransformEngine<OnnxAgeModel, Box<dyn FaceAligner>>;

// filled once the model has been loaded
type AppState = Arc<OnceLock<Arc<Engine>>>;

#[derive(FromArgs)]
/// Serves face age transformation over HTTP.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// path to the ONNX age model
    #[argh(option, short = 'm')]
    model: PathBuf,

    /// path to the ONNX 68-point landmark model; without it faces are only resized
    #[argh(option, short = 'l')]
    landmarks: Option<PathBuf>,

    /// device to run the age model on: cpu, cuda or cuda:<id>
    #[argh(option, short = 'd', default = "Device::Cpu")]
    device: Device,

    /// optional JSON file with the engine configuration
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

async fn post_transform_age(
    State(state): State<AppState>,
    payload: Result<Json<TransformRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Some(engine) = state.get().cloned() else {
        log::debug!("Model is still loading");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ResponseEnvelope::failure("model is still loading")),
        );
    };

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ResponseEnvelope::failure(rejection.body_text())),
            );
        }
    };

    // the pipeline is synchronous, run it on the blocking pool
    let result = tokio::task::spawn_blocking(move || {
        engine.try_transform(&request.image, &request.target_age)
    })
    .await;

    match result {
        Ok(Ok(image)) => (StatusCode::OK, Json(ResponseEnvelope::success(image))),
        Ok(Err(err)) => {
            let status = if err.error.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(ResponseEnvelope::failure(err.error.public_message())),
            )
        }
        Err(e) => {
            log::error!("Pipeline task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ResponseEnvelope::failure("inference failed")),
            )
        }
    }
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.get() {
        Some(engine) => (StatusCode::OK, Json(engine.health())),
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(HealthStatus::loading())),
    }
}

// loads the age model and the landmark model together
fn load_engine(
    model_path: PathBuf,
    landmarks_path: Option<PathBuf>,
    device: Device,
    config: EngineConfig,
) -> Result<Engine, Box<dyn std::error::Error + Send + Sync>> {
    let model = OnnxAgeModel::load(&model_path, device)?;

    let aligner: Box<dyn FaceAligner> = match landmarks_path {
        Some(path) => {
            let detector = OnnxLandmarkDetector::load(&path)?;
            Box::new(LandmarkAligner::new(detector, &config))
        }
        None => {
            log::warn!("No landmark model given, faces will be resized without alignment");
            Box::new(DisabledAligner)
        }
    };

    Ok(AgeTransformEngine::new(model, aligner, config)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let state: AppState = Arc::new(OnceLock::new());

    tokio::task::spawn_blocking({
        let state = state.clone();
        let ServerArgs {
            model,
            landmarks,
            device,
            ..
        } = args;
        move || match load_engine(model, landmarks, device, config) {
            Ok(engine) => {
                let _ = state.set(Arc::new(engine));
                log::info!("Model ready");
            }
            Err(e) => {
                log::error!("Failed to load the model: {e}");
                std::process::exit(1);
            }
        }
    });

    let app = Router::new()
        .route("/", get(|| async { "Welcome to the age transformation service!" }))
        .route("/health", get(get_health))
        .route("/transform_age", post(post_transform_age))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    log::info!("Starting the server");
    log::info!("Listening on: {}", addr);
    log::info!("Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
