//! HTTP surface: `POST /verify` and `GET /health`.
//!
//! `/verify` answers 200 with the verifier's result, 400 when an image is
//! missing, and 500 for every other failure. Failures are never retried.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::middleware::{self, CorsPolicy};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::InvalidHeaderValue;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceverify_core::verify::{
    DEFAULT_DETECTOR_BACKEND, DEFAULT_DISTANCE_METRIC, DEFAULT_ENFORCE_DETECTION, DEFAULT_MODEL_NAME,
};
use faceverify_core::{decode_image, DecodeError, VerificationRequest, VerificationResult};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const MISSING_INPUT_MESSAGE: &str = "img1 or img2 missing";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{}", MISSING_INPUT_MESSAGE)]
    MissingInput,
    #[error("{0}")]
    MalformedBody(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Verification(#[from] EngineError),
    #[error("request processing aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl ApiError {
    /// Only a missing image is the client's fault; everything else is a 500.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingInput => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::MissingInput => "missing_input",
            ApiError::MalformedBody(_) => "malformed_body",
            ApiError::Decode(_) => "decode",
            ApiError::Verification(_) => "verification",
            ApiError::Aborted(_) => "aborted",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.kind(), error = %self, "verify request failed");
        } else {
            tracing::debug!(kind = self.kind(), "verify request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

/// Build the router with body limit, CORS and request-id layers.
pub fn router(state: AppState, config: &Config) -> Result<Router, InvalidHeaderValue> {
    let cors = CorsPolicy::new(&config.cors_origin)?;

    Ok(Router::new()
        .route("/verify", post(handle_verify))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(cors, middleware::cors))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state))
}

/// `POST /verify`.
///
/// The body is taken as raw bytes so that unreadable or malformed bodies go
/// through the same 500 path as decode and verification failures.
pub async fn handle_verify(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<VerificationResult>, ApiError> {
    let body = body.map_err(|e| ApiError::MalformedBody(e.body_text()))?;
    verify_body(&state.engine, &body).await.map(Json)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

/// `GET /health`.
async fn handle_health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Fields of a `/verify` body after validation and defaulting.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyParams {
    pub img1: String,
    pub img2: String,
    pub model_name: String,
    pub detector_backend: String,
    pub distance_metric: String,
    pub enforce_detection: bool,
}

impl VerifyParams {
    /// Parse a JSON request body.
    ///
    /// The image presence check runs first, so a body missing an image gets
    /// the 400 even if other fields are also invalid.
    pub fn from_json(body: &[u8]) -> Result<Self, ApiError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::MalformedBody(format!("invalid JSON body: {e}")))?;
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(ApiError::MalformedBody(format!(
                    "request body must be a JSON object, got {}",
                    type_name(&other)
                )))
            }
        };

        let (Some(img1), Some(img2)) = (take_image(&mut fields, "img1"), take_image(&mut fields, "img2")) else {
            return Err(ApiError::MissingInput);
        };

        Ok(Self {
            img1: expect_string("img1", img1)?,
            img2: expect_string("img2", img2)?,
            model_name: string_or(&mut fields, "model_name", DEFAULT_MODEL_NAME)?,
            detector_backend: string_or(&mut fields, "detector_backend", DEFAULT_DETECTOR_BACKEND)?,
            distance_metric: string_or(&mut fields, "distance_metric", DEFAULT_DISTANCE_METRIC)?,
            enforce_detection: bool_or(&mut fields, "enforce_detection", DEFAULT_ENFORCE_DETECTION)?,
        })
    }

    /// Decode both images, `img1` first, and assemble the verifier request.
    pub fn into_request(self) -> Result<VerificationRequest, ApiError> {
        let img1 = decode_image(&self.img1)?;
        let img2 = decode_image(&self.img2)?;

        Ok(VerificationRequest {
            img1,
            img2,
            model_name: self.model_name,
            detector_backend: self.detector_backend,
            distance_metric: self.distance_metric,
            enforce_detection: self.enforce_detection,
        })
    }
}

/// Full `/verify` pipeline on a raw body: parse, decode, verify.
pub async fn verify_body(engine: &EngineHandle, body: &[u8]) -> Result<VerificationResult, ApiError> {
    let params = VerifyParams::from_json(body)?;

    tracing::debug!(
        model = %params.model_name,
        detector = %params.detector_backend,
        metric = %params.distance_metric,
        enforce_detection = params.enforce_detection,
        img1_len = params.img1.len(),
        img2_len = params.img2.len(),
        "verify request"
    );

    // Image decoding is CPU-bound; keep it off the async workers.
    let request = tokio::task::spawn_blocking(move || params.into_request()).await??;

    Ok(engine.verify(request).await?)
}

/// Absent and empty values count as a missing image: `null`, `""`, `false`,
/// zero, `[]` and `{}`.
fn take_image(fields: &mut Map<String, Value>, key: &str) -> Option<Value> {
    fields.remove(key).filter(|value| !is_empty_value(value))
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

fn expect_string(key: &str, value: Value) -> Result<String, ApiError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ApiError::MalformedBody(format!(
            "{key} must be a string, got {}",
            type_name(&other)
        ))),
    }
}

fn string_or(fields: &mut Map<String, Value>, key: &str, default: &str) -> Result<String, ApiError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(value) => expect_string(key, value),
    }
}

fn bool_or(fields: &mut Map<String, Value>, key: &str, default: bool) -> Result<bool, ApiError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(b),
        Some(other) => Err(ApiError::MalformedBody(format!(
            "{key} must be a boolean, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
