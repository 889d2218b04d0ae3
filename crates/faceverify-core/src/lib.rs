//! faceverify-core: image payload decoding and face verification.
//!
//! `decode` turns client payloads into RGB bitmaps; `verify` defines the
//! verification contract and an ONNX Runtime implementation built on SCRFD
//! detection and Facenet/ArcFace embeddings.

pub mod alignment;
pub mod decode;
pub mod detector;
pub mod recognizer;
pub mod types;
pub mod verify;

use std::path::PathBuf;

pub use decode::{decode_image, DecodeError, DecodedImage};
pub use detector::FaceDetector;
pub use recognizer::{FaceModelKind, FaceRecognizer};
pub use types::{BoundingBox, DistanceMetric, Embedding};
pub use verify::{FaceVerifier, OnnxVerifier, VerificationRequest, VerificationResult, VerifyError};

/// Default ONNX model directory: `$XDG_DATA_HOME/faceverify/models`, falling
/// back to `~/.local/share/faceverify/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceverify/models")
}
