use faceverify_core::{FaceVerifier, VerificationRequest, VerificationResult, VerifyError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("verification engine is not running")]
    ChannelClosed,
    #[error("failed to start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A queued verification plus the channel its answer goes back on.
struct EngineRequest {
    request: VerificationRequest,
    reply: oneshot::Sender<Result<VerificationResult, VerifyError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Queue a verification and wait for the verifier's answer.
    pub async fn verify(&self, request: VerificationRequest) -> Result<VerificationResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest { request, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(result?)
    }
}

/// Run `verifier` on a dedicated OS thread.
///
/// Requests are handled one at a time in arrival order; the thread exits once
/// every `EngineHandle` is dropped. A panicking verifier fails only the
/// request it was serving.
pub fn spawn_engine<V>(mut verifier: V, queue_depth: usize) -> Result<EngineHandle, EngineError>
where
    V: FaceVerifier + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("faceverify-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(EngineRequest { request, reply }) = rx.blocking_recv() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| verifier.verify(request)))
                    .unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(error = %message, "verifier panicked");
                        Err(VerifyError::Internal(message))
                    });
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "verification failed");
                }
                // The requester may have gone away; nothing to do then.
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "verifier panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceverify_core::verify::{FacialArea, FacialAreas};
    use image::{Rgb, RgbImage};

    /// Reports the top-left red value of each image as the distance.
    struct PixelVerifier;

    impl FaceVerifier for PixelVerifier {
        fn verify(&mut self, req: VerificationRequest) -> Result<VerificationResult, VerifyError> {
            if req.model_name == "broken" {
                return Err(VerifyError::Internal("model exploded".into()));
            }
            let area = FacialArea { x: 0, y: 0, w: 1, h: 1, left_eye: None, right_eye: None };
            Ok(VerificationResult {
                verified: req.img1 == req.img2,
                distance: req.img1.get_pixel(0, 0).0[0] as f64,
                threshold: req.img2.get_pixel(0, 0).0[0] as f64,
                model: req.model_name,
                detector_backend: req.detector_backend,
                similarity_metric: req.distance_metric,
                facial_areas: FacialAreas { img1: area.clone(), img2: area },
                time: 0.0,
            })
        }
    }

    fn request(model: &str, a: u8, b: u8) -> VerificationRequest {
        VerificationRequest {
            img1: RgbImage::from_pixel(2, 2, Rgb([a, 0, 0])),
            img2: RgbImage::from_pixel(2, 2, Rgb([b, 0, 0])),
            model_name: model.into(),
            detector_backend: "skip".into(),
            distance_metric: "cosine".into(),
            enforce_detection: false,
        }
    }

    #[tokio::test]
    async fn test_engine_roundtrip() {
        let engine = spawn_engine(PixelVerifier, 4).unwrap();
        let result = engine.verify(request("Facenet", 7, 7)).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.distance, 7.0);
    }

    #[tokio::test]
    async fn test_engine_propagates_verifier_error() {
        let engine = spawn_engine(PixelVerifier, 4).unwrap();
        let err = engine.verify(request("broken", 1, 2)).await.unwrap_err();
        assert!(matches!(err, EngineError::Verify(VerifyError::Internal(_))));
        assert_eq!(err.to_string(), "model exploded");
    }

    /// Panics on its first call, then answers normally.
    struct FlakyVerifier {
        calls: usize,
    }

    impl FaceVerifier for FlakyVerifier {
        fn verify(&mut self, req: VerificationRequest) -> Result<VerificationResult, VerifyError> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("onnx session poisoned");
            }
            PixelVerifier.verify(req)
        }
    }

    #[tokio::test]
    async fn test_engine_survives_verifier_panic() {
        let engine = spawn_engine(FlakyVerifier { calls: 0 }, 4).unwrap();

        let err = engine.verify(request("Facenet", 1, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Verify(VerifyError::Internal(_))));
        assert_eq!(err.to_string(), "onnx session poisoned");

        let result = engine.verify(request("Facenet", 9, 9)).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.distance, 9.0);
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u32), "verifier panicked");
    }

    #[tokio::test]
    async fn test_concurrent_requests_keep_their_own_images() {
        let engine = spawn_engine(PixelVerifier, 2).unwrap();

        let tasks: Vec<_> = (0..32u8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let result = engine.verify(request("Facenet", i, 255 - i)).await.unwrap();
                    (i, result)
                })
            })
            .collect();

        for task in tasks {
            let (i, result) = task.await.unwrap();
            assert_eq!(result.distance, i as f64);
            assert_eq!(result.threshold, (255 - i) as f64);
        }
    }
}
