use faceverify_core::FaceModelKind;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5005).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Load the detector and `default_model` at startup instead of on first request.
    pub preload: bool,
    /// Recognition model to preload.
    pub default_model: FaceModelKind,
    /// Verification requests that may wait for the engine before senders block.
    pub queue_depth: usize,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Value sent in `Access-Control-Allow-Origin`.
    pub cors_origin: String,
}

impl Config {
    /// Load configuration from `FACEVERIFY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEVERIFY_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| faceverify_core::default_model_dir());

        Self {
            bind: env_parse("FACEVERIFY_BIND", SocketAddr::from(([0, 0, 0, 0], 5005))),
            model_dir,
            preload: std::env::var("FACEVERIFY_PRELOAD")
                .map(|v| v != "0")
                .unwrap_or(true),
            default_model: env_parse("FACEVERIFY_DEFAULT_MODEL", FaceModelKind::Facenet),
            queue_depth: env_parse("FACEVERIFY_QUEUE_DEPTH", 16usize).max(1),
            max_body_bytes: env_parse("FACEVERIFY_MAX_BODY_BYTES", 32 * 1024 * 1024),
            cors_origin: std::env::var("FACEVERIFY_CORS_ORIGIN").unwrap_or_else(|_| "*".to_string()),
        }
    }
}

/// Parse `key` with `FromStr`, falling back to `default` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable config value");
            default
        }),
        Err(_) => default,
    }
}
