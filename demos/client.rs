use argh::FromArgs;
use kornia_agetransform::{RasterImage, RawTargetAge, ResponseEnvelope, TransformRequest, codec};
use std::path::{Path, PathBuf};

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5000;
const UPLOAD_JPEG_QUALITY: u8 = 95;

#[derive(FromArgs)]
/// Age transformation client
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "inference" or "health"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Inference(InferenceCommand),
    Health(HealthCommand),
}

#[derive(FromArgs)]
/// Re-render the face in an image at a target age
#[argh(subcommand, name = "inference")]
struct InferenceCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the target age in years
    #[argh(option, short = 'a')]
    target_age: i64,

    /// where to write the transformed image
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(FromArgs)]
/// Check whether the server is ready
#[argh(subcommand, name = "health")]
struct HealthCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Inference(command) => {
            let image = read_image_from_path(&command.image_path)?;
            let request = TransformRequest {
                image: codec::encode(&image, UPLOAD_JPEG_QUALITY)?,
                target_age: RawTargetAge::Integer(command.target_age),
            };

            let response = client
                .post(format!("http://{}/transform_age", addr))
                .json(&request)
                .send()
                .await?;
            let status = response.status();
            let envelope = response.json::<ResponseEnvelope>().await?;

            match (envelope.transformed_image(), command.output) {
                (Some(payload), Some(output)) => {
                    std::fs::write(&output, payload.to_bytes()?)?;
                    println!("Transformed image written to {}", output.display());
                }
                (Some(_), None) => println!("Transformation succeeded ({status})"),
                (None, _) => println!(
                    "Transformation failed ({status}): {}",
                    envelope.error().unwrap_or("unknown error")
                ),
            }
        }
        ClientCommands::Health(_) => {
            let response = client.get(format!("http://{}/health", addr)).send().await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

// Helper function
fn read_image_from_path(path: &Path) -> Result<RasterImage, String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| "Invalid file extension".to_string())?;

    let image: kornia_image::Image<u8, 3, kornia_image::allocator::CpuAllocator> =
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => {
                kornia_io::jpeg::read_image_jpeg_rgb8(path).map_err(|e| e.to_string())?
            }
            "png" => kornia_io::png::read_image_png_rgb8(path).map_err(|e| e.to_string())?,
            _ => return Err(format!("Unsupported image format: {}", extension)),
        };

    RasterImage::from_raw(
        image.width() as u32,
        image.height() as u32,
        image.as_slice().to_vec(),
    )
    .ok_or_else(|| "Image buffer does not match its size".to_string())
}
