use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceverify_core::decode::encode_data_uri;
use faceverify_core::verify::{DEFAULT_DETECTOR_BACKEND, DEFAULT_DISTANCE_METRIC, DEFAULT_MODEL_NAME};
use std::path::Path;

#[derive(Parser)]
#[command(name = "faceverify", about = "Face verification client for faceverifyd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether two images show the same person
    Verify {
        /// First image file
        img1: String,
        /// Second image file
        img2: String,
        /// Base URL of the faceverifyd instance
        #[arg(long, default_value = "http://127.0.0.1:5005")]
        endpoint: String,
        /// Recognition model (Facenet, Facenet512, ArcFace)
        #[arg(long, default_value = DEFAULT_MODEL_NAME)]
        model: String,
        /// Face detector backend
        #[arg(long, default_value = DEFAULT_DETECTOR_BACKEND)]
        detector: String,
        /// Distance metric (cosine, euclidean, euclidean_l2)
        #[arg(long, default_value = DEFAULT_DISTANCE_METRIC)]
        metric: String,
        /// Fail when no face is found instead of using the whole image
        #[arg(long)]
        enforce_detection: bool,
    },
    /// Print an image file as a base64 data URI
    Encode {
        /// Image file
        img: String,
    },
}

/// Read an image file and wrap it in a data URI with the MIME type its
/// extension implies.
fn read_data_uri(path: &str) -> Result<String> {
    let path = Path::new(path);
    let format = image::ImageFormat::from_path(path)
        .with_context(|| format!("unrecognised image type: {}", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(encode_data_uri(&bytes, format.to_mime_type()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify {
            img1,
            img2,
            endpoint,
            model,
            detector,
            metric,
            enforce_detection,
        } => {
            let body = serde_json::json!({
                "img1": read_data_uri(&img1)?,
                "img2": read_data_uri(&img2)?,
                "model_name": model,
                "detector_backend": detector,
                "distance_metric": metric,
                "enforce_detection": enforce_detection,
            });

            let url = format!("{}/verify", endpoint.trim_end_matches('/'));
            tracing::debug!(%url, "submitting verification");

            let resp = reqwest::Client::new()
                .post(&url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to reach {url}"))?;
            let status = resp.status();
            let payload: serde_json::Value = resp
                .json()
                .await
                .context("server returned a non-JSON response")?;

            if !status.is_success() {
                let message = payload
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error");
                bail!("verification failed ({status}): {message}");
            }

            println!("{}", serde_json::to_string_pretty(&payload)?);
            let verified = payload.get("verified").and_then(|v| v.as_bool()).unwrap_or(false);
            println!("{}", if verified { "Same person" } else { "Different people" });
        }
        Commands::Encode { img } => {
            println!("{}", read_data_uri(&img)?);
        }
    }

    Ok(())
}
