//! Verification contract and the ONNX-backed verifier.
//!
//! [`FaceVerifier`] is the only thing the HTTP layer knows about: it receives
//! two decoded images plus opaque model/detector/metric identifiers and
//! answers with a [`VerificationResult`] or a [`VerifyError`].

use crate::decode::DecodedImage;
use crate::detector::{DetectorError, FaceDetector, SCRFD_MODEL_FILE};
use crate::recognizer::{FaceModelKind, FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, DistanceMetric, Embedding};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_MODEL_NAME: &str = "Facenet";
pub const DEFAULT_DETECTOR_BACKEND: &str = "opencv";
pub const DEFAULT_DISTANCE_METRIC: &str = "cosine";
pub const DEFAULT_ENFORCE_DETECTION: bool = false;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("invalid model_name '{0}': expected one of Facenet, Facenet512, ArcFace")]
    UnknownModel(String),
    #[error("invalid detector_backend '{0}': expected one of opencv, retinaface, scrfd, skip")]
    UnknownDetector(String),
    #[error("invalid distance_metric '{0}': expected one of cosine, euclidean, euclidean_l2")]
    UnknownMetric(String),
    #[error(
        "Face could not be detected in {image}. Please confirm that the picture is a face photo \
         or consider setting enforce_detection to false."
    )]
    FaceNotDetected { image: &'static str },
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Internal(String),
}

/// One verification call: two images and the parameters to compare them with.
///
/// Identifiers are passed through untouched; interpreting them is the
/// verifier's job.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub img1: DecodedImage,
    pub img2: DecodedImage,
    pub model_name: String,
    pub detector_backend: String,
    pub distance_metric: String,
    pub enforce_detection: bool,
}

/// Face region reported back to the client, in source-image pixels.
///
/// Eye positions are from the subject's perspective, so `left_eye` sits on
/// the right-hand side of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub left_eye: Option<(i32, i32)>,
    pub right_eye: Option<(i32, i32)>,
}

impl From<&BoundingBox> for FacialArea {
    fn from(b: &BoundingBox) -> Self {
        let point = |(x, y): (f32, f32)| (x.round() as i32, y.round() as i32);
        Self {
            x: b.x.round() as i32,
            y: b.y.round() as i32,
            w: b.width.round() as i32,
            h: b.height.round() as i32,
            left_eye: b.landmarks.map(|l| point(l[1])),
            right_eye: b.landmarks.map(|l| point(l[0])),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacialAreas {
    pub img1: FacialArea,
    pub img2: FacialArea,
}

/// Outcome of a verification, serialized to the client as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub distance: f64,
    pub threshold: f64,
    pub model: String,
    pub detector_backend: String,
    pub similarity_metric: String,
    pub facial_areas: FacialAreas,
    /// Seconds spent in the verifier.
    pub time: f64,
}

/// Face verification capability.
///
/// Implementations may hold non-reentrant resources (inference sessions), so
/// `verify` takes `&mut self`; callers serialize access.
pub trait FaceVerifier: Send {
    fn verify(&mut self, request: VerificationRequest) -> Result<VerificationResult, VerifyError>;
}

/// Face detectors selectable through `detector_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorBackend {
    /// SCRFD; also answers to `opencv` and `retinaface`.
    Scrfd,
    /// No detection: the whole image is the face.
    Skip,
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrfd" | "retinaface" | "opencv" => Ok(DetectorBackend::Scrfd),
            "skip" => Ok(DetectorBackend::Skip),
            other => Err(other.to_string()),
        }
    }
}

/// Decision threshold for a model/metric pair; distances at or below it match.
pub fn threshold(model: FaceModelKind, metric: DistanceMetric) -> f64 {
    use DistanceMetric::*;
    use FaceModelKind::*;

    match (model, metric) {
        (Facenet, Cosine) => 0.40,
        (Facenet, Euclidean) => 10.0,
        (Facenet, EuclideanL2) => 0.80,
        (Facenet512, Cosine) => 0.30,
        (Facenet512, Euclidean) => 23.56,
        (Facenet512, EuclideanL2) => 1.04,
        (ArcFace, Cosine) => 0.68,
        (ArcFace, Euclidean) => 4.15,
        (ArcFace, EuclideanL2) => 1.13,
    }
}

/// Distance between two embeddings and whether it clears the threshold.
pub fn compare(a: &Embedding, b: &Embedding, model: FaceModelKind, metric: DistanceMetric) -> (f64, f64, bool) {
    let distance = a.distance(b, metric) as f64;
    let threshold = threshold(model, metric);
    (distance, threshold, distance <= threshold)
}

/// Verifier backed by ONNX Runtime: SCRFD detection plus one of the
/// [`FaceModelKind`] recognizers.
///
/// Models are loaded from `model_dir` on first use and kept for the lifetime
/// of the verifier.
pub struct OnnxVerifier {
    model_dir: PathBuf,
    detector: Option<FaceDetector>,
    recognizers: HashMap<FaceModelKind, FaceRecognizer>,
}

impl OnnxVerifier {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            detector: None,
            recognizers: HashMap::new(),
        }
    }

    /// Load the detector and the given recognizers now instead of on first request.
    pub fn preload(&mut self, models: &[FaceModelKind]) -> Result<(), VerifyError> {
        self.detector()?;
        for &kind in models {
            self.recognizer(kind)?;
        }
        Ok(())
    }

    fn detector(&mut self) -> Result<&mut FaceDetector, VerifyError> {
        if self.detector.is_none() {
            let detector = FaceDetector::load(&self.model_dir.join(SCRFD_MODEL_FILE))?;
            self.detector = Some(detector);
        }
        self.detector
            .as_mut()
            .ok_or_else(|| VerifyError::Internal("detector unavailable".into()))
    }

    fn recognizer(&mut self, kind: FaceModelKind) -> Result<&mut FaceRecognizer, VerifyError> {
        if !self.recognizers.contains_key(&kind) {
            let recognizer = FaceRecognizer::load(kind, &self.model_dir)?;
            self.recognizers.insert(kind, recognizer);
        }
        self.recognizers
            .get_mut(&kind)
            .ok_or_else(|| VerifyError::Internal(format!("{kind} recognizer unavailable")))
    }

    /// Pick the face to embed: the most confident detection, or the whole
    /// frame when nothing is found and detection is not enforced.
    fn locate_face(
        &mut self,
        backend: DetectorBackend,
        image: &DecodedImage,
        enforce_detection: bool,
        label: &'static str,
    ) -> Result<BoundingBox, VerifyError> {
        let full_frame = || BoundingBox::full_frame(image.width(), image.height());

        let found = match backend {
            DetectorBackend::Skip => return Ok(full_frame()),
            DetectorBackend::Scrfd => self.detector()?.detect(image)?.into_iter().next(),
        };

        match found {
            Some(face) => Ok(face),
            None if enforce_detection => Err(VerifyError::FaceNotDetected { image: label }),
            None => {
                tracing::debug!(image = label, "no face detected; using the whole image");
                Ok(full_frame())
            }
        }
    }
}

impl FaceVerifier for OnnxVerifier {
    fn verify(&mut self, request: VerificationRequest) -> Result<VerificationResult, VerifyError> {
        let started = Instant::now();

        let model = FaceModelKind::from_str(&request.model_name).map_err(VerifyError::UnknownModel)?;
        let backend =
            DetectorBackend::from_str(&request.detector_backend).map_err(VerifyError::UnknownDetector)?;
        let metric =
            DistanceMetric::from_str(&request.distance_metric).map_err(VerifyError::UnknownMetric)?;

        let face1 = self.locate_face(backend, &request.img1, request.enforce_detection, "img1")?;
        let face2 = self.locate_face(backend, &request.img2, request.enforce_detection, "img2")?;

        let recognizer = self.recognizer(model)?;
        let emb1 = recognizer.extract(&request.img1, &face1)?;
        let emb2 = recognizer.extract(&request.img2, &face2)?;

        let (distance, threshold, verified) = compare(&emb1, &emb2, model, metric);
        let elapsed = started.elapsed().as_secs_f64();

        tracing::info!(
            %model,
            detector = %request.detector_backend,
            %metric,
            distance,
            threshold,
            verified,
            elapsed_ms = (elapsed * 1000.0) as u64,
            "verification complete"
        );

        Ok(VerificationResult {
            verified,
            distance,
            threshold,
            model: model.name().to_string(),
            detector_backend: request.detector_backend,
            similarity_metric: metric.as_str().to_string(),
            facial_areas: FacialAreas {
                img1: FacialArea::from(&face1),
                img2: FacialArea::from(&face2),
            },
            time: (elapsed * 100.0).round() / 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec() }
    }

    fn request(model: &str, detector: &str, metric: &str) -> VerificationRequest {
        VerificationRequest {
            img1: RgbImage::from_pixel(4, 4, Rgb([0, 0, 0])),
            img2: RgbImage::from_pixel(4, 4, Rgb([0, 0, 0])),
            model_name: model.into(),
            detector_backend: detector.into(),
            distance_metric: metric.into(),
            enforce_detection: false,
        }
    }

    fn missing_model_dir() -> PathBuf {
        std::env::temp_dir().join("faceverify-verify-tests-empty")
    }

    #[test]
    fn test_detector_backend_vocabulary() {
        assert_eq!("opencv".parse::<DetectorBackend>(), Ok(DetectorBackend::Scrfd));
        assert_eq!("retinaface".parse::<DetectorBackend>(), Ok(DetectorBackend::Scrfd));
        assert_eq!("skip".parse::<DetectorBackend>(), Ok(DetectorBackend::Skip));
        assert_eq!("mtcnn".parse::<DetectorBackend>(), Err("mtcnn".to_string()));
    }

    #[test]
    fn test_compare_identical_embeddings_match() {
        let a = emb(&[0.3, 0.4, 0.5]);
        let (distance, threshold, verified) =
            compare(&a, &a, FaceModelKind::Facenet, DistanceMetric::Cosine);
        assert!(distance.abs() < 1e-6);
        assert_eq!(threshold, 0.40);
        assert!(verified);
    }

    #[test]
    fn test_compare_orthogonal_embeddings_do_not_match() {
        let (distance, _, verified) = compare(
            &emb(&[1.0, 0.0]),
            &emb(&[0.0, 1.0]),
            FaceModelKind::ArcFace,
            DistanceMetric::Cosine,
        );
        assert!((distance - 1.0).abs() < 1e-6);
        assert!(!verified);
    }

    #[test]
    fn test_compare_threshold_is_inclusive() {
        // Euclidean distance of exactly 10.0 for Facenet.
        let (distance, threshold, verified) = compare(
            &emb(&[0.0, 0.0]),
            &emb(&[6.0, 8.0]),
            FaceModelKind::Facenet,
            DistanceMetric::Euclidean,
        );
        assert_eq!(distance, threshold);
        assert!(verified);
    }

    #[test]
    fn test_threshold_table() {
        assert_eq!(threshold(FaceModelKind::Facenet512, DistanceMetric::Cosine), 0.30);
        assert_eq!(threshold(FaceModelKind::ArcFace, DistanceMetric::EuclideanL2), 1.13);
    }

    #[test]
    fn test_unknown_identifiers_fail_before_loading_models() {
        let mut verifier = OnnxVerifier::new(missing_model_dir());

        let err = verifier.verify(request("VGG-Face", "opencv", "cosine")).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownModel(ref m) if m == "VGG-Face"));
        assert!(err.to_string().contains("VGG-Face"));

        let err = verifier.verify(request("Facenet", "dlib", "cosine")).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownDetector(_)));

        let err = verifier.verify(request("Facenet", "opencv", "manhattan")).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownMetric(_)));
    }

    #[test]
    fn test_missing_model_files_surface_as_errors() {
        let mut verifier = OnnxVerifier::new(missing_model_dir());

        let err = verifier.verify(request("Facenet", "opencv", "cosine")).unwrap_err();
        assert!(matches!(err, VerifyError::Detector(DetectorError::ModelNotFound(_))));

        // `skip` never touches the detector, so the recognizer is the first miss.
        let err = verifier.verify(request("Facenet", "skip", "cosine")).unwrap_err();
        assert!(matches!(err, VerifyError::Recognizer(RecognizerError::ModelNotFound(_))));
        assert!(err.to_string().contains("facenet128.onnx"));
    }

    #[test]
    fn test_preload_reports_missing_detector() {
        let mut verifier = OnnxVerifier::new(missing_model_dir());
        assert!(verifier.preload(&[FaceModelKind::Facenet]).is_err());
    }

    #[test]
    fn test_facial_area_eyes_from_subject_perspective() {
        let b = BoundingBox {
            x: 10.4, y: 20.6, width: 50.0, height: 60.0, confidence: 0.9,
            landmarks: Some([(20.0, 30.0), (40.0, 30.0), (30.0, 40.0), (22.0, 50.0), (38.0, 50.0)]),
        };
        let area = FacialArea::from(&b);
        assert_eq!((area.x, area.y, area.w, area.h), (10, 21, 50, 60));
        assert_eq!(area.left_eye, Some((40, 30)));
        assert_eq!(area.right_eye, Some((20, 30)));

        let whole = FacialArea::from(&BoundingBox::full_frame(640, 480));
        assert_eq!((whole.w, whole.h, whole.left_eye), (640, 480, None));
    }

    #[test]
    fn test_result_serializes_expected_fields() {
        let area = FacialArea { x: 0, y: 0, w: 4, h: 4, left_eye: None, right_eye: None };
        let result = VerificationResult {
            verified: true,
            distance: 0.25,
            threshold: 0.4,
            model: "Facenet".into(),
            detector_backend: "opencv".into(),
            similarity_metric: "cosine".into(),
            facial_areas: FacialAreas { img1: area.clone(), img2: area },
            time: 0.12,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verified"], true);
        assert_eq!(json["similarity_metric"], "cosine");
        assert_eq!(json["facial_areas"]["img1"]["w"], 4);
        assert!(json["facial_areas"]["img2"]["left_eye"].is_null());
    }
}
