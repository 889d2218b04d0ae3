//! Face embedding extraction via ONNX Runtime.
//!
//! One `FaceRecognizer` wraps one embedding model. The supported models differ
//! in input size, normalization and tensor layout; [`FaceModelKind`] carries
//! those per-model constants.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("embedding extraction failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding models the ONNX backend knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaceModelKind {
    /// FaceNet, 128-d (Keras export, NHWC).
    Facenet,
    /// FaceNet, 512-d (Keras export, NHWC).
    Facenet512,
    /// InsightFace ArcFace w600k_r50 (NCHW).
    ArcFace,
}

/// Tensor layout expected by a model's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nchw,
    Nhwc,
}

impl FaceModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            FaceModelKind::Facenet => "Facenet",
            FaceModelKind::Facenet512 => "Facenet512",
            FaceModelKind::ArcFace => "ArcFace",
        }
    }

    /// Model file name inside the model directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            FaceModelKind::Facenet => "facenet128.onnx",
            FaceModelKind::Facenet512 => "facenet512.onnx",
            FaceModelKind::ArcFace => "w600k_r50.onnx",
        }
    }

    /// Side length of the square aligned crop.
    pub fn input_size(&self) -> u32 {
        match self {
            FaceModelKind::Facenet | FaceModelKind::Facenet512 => 160,
            FaceModelKind::ArcFace => 112,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        match self {
            FaceModelKind::Facenet => 128,
            FaceModelKind::Facenet512 | FaceModelKind::ArcFace => 512,
        }
    }

    /// (mean, std) applied per channel: `(pixel - mean) / std`.
    fn normalization(&self) -> (f32, f32) {
        // Both families map [0, 255] onto [-1, 1].
        (127.5, 127.5)
    }

    pub fn layout(&self) -> Layout {
        match self {
            FaceModelKind::Facenet | FaceModelKind::Facenet512 => Layout::Nhwc,
            FaceModelKind::ArcFace => Layout::Nchw,
        }
    }
}

impl fmt::Display for FaceModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FaceModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Facenet" => Ok(FaceModelKind::Facenet),
            "Facenet512" => Ok(FaceModelKind::Facenet512),
            "ArcFace" => Ok(FaceModelKind::ArcFace),
            other => Err(other.to_string()),
        }
    }
}

/// Embedding extractor for a single model.
pub struct FaceRecognizer {
    kind: FaceModelKind,
    session: Session,
}

impl FaceRecognizer {
    /// Load `kind`'s ONNX file from `model_dir`.
    pub fn load(kind: FaceModelKind, model_dir: &Path) -> Result<Self, RecognizerError> {
        let path = model_dir.join(kind.file_name());
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&path)?;

        tracing::info!(
            model = %kind,
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self { kind, session })
    }

    /// Extract an embedding for `face` in `image`.
    ///
    /// Faces with landmarks are aligned to the canonical layout; faces without
    /// (whole-frame fallback) are cropped and resized.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let size = self.kind.input_size();
        let crop = match &face.landmarks {
            Some(landmarks) => alignment::align_face(image, landmarks, size),
            None => alignment::crop_face(image, face, size),
        };

        let input = preprocess(&crop, self.kind);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("{}: {e}", self.kind)))?;

        let expected = self.kind.embedding_dim();
        if raw.len() != expected {
            return Err(RecognizerError::InferenceFailed(format!(
                "{} produced a {}-dim embedding, expected {expected}",
                self.kind,
                raw.len()
            )));
        }

        Ok(Embedding { values: raw.to_vec() })
    }
}

/// Normalize an aligned RGB crop into the model's input tensor.
fn preprocess(crop: &RgbImage, kind: FaceModelKind) -> Array4<f32> {
    let size = kind.input_size() as usize;
    let (mean, std) = kind.normalization();
    let mut tensor = match kind.layout() {
        Layout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        Layout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
    };

    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            let v = (pixel.0[c] as f32 - mean) / std;
            match kind.layout() {
                Layout::Nchw => tensor[[0, c, y, x]] = v,
                Layout::Nhwc => tensor[[0, y, x, c]] = v,
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_model_names_roundtrip() {
        for kind in [FaceModelKind::Facenet, FaceModelKind::Facenet512, FaceModelKind::ArcFace] {
            assert_eq!(kind.name().parse::<FaceModelKind>(), Ok(kind));
        }
        assert_eq!("VGG-Face".parse::<FaceModelKind>(), Err("VGG-Face".to_string()));
        // Names are case-sensitive.
        assert!("facenet".parse::<FaceModelKind>().is_err());
    }

    #[test]
    fn test_preprocess_nchw_shape() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let t = preprocess(&crop, FaceModelKind::ArcFace);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_nhwc_shape_and_channel_order() {
        let crop = RgbImage::from_pixel(160, 160, Rgb([255, 0, 128]));
        let t = preprocess(&crop, FaceModelKind::Facenet);
        assert_eq!(t.shape(), &[1, 160, 160, 3]);
        assert!((t[[0, 5, 7, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 5, 7, 1]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let t = preprocess(&crop, FaceModelKind::ArcFace);
        let expected = (128.0 - 127.5) / 127.5;
        assert!((t[[0, 2, 50, 60]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let dir = std::env::temp_dir().join("faceverify-no-models-here");
        let err = FaceRecognizer::load(FaceModelKind::Facenet, &dir).err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(p) if p.ends_with("facenet128.onnx")));
    }
}
