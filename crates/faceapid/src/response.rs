//! Public response shapes and the error-to-status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use faceapi_core::{DistanceMetric, FaceAnalysis, InvalidImageError, Verification};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::engine::EngineError;

pub const ROOT_MESSAGE: &str = "DeepFace API is Running. Access /docs for UI.";
pub const NO_FACE_MESSAGE: &str = "No face detected";

#[derive(Debug, Serialize, ToSchema)]
pub struct RootResponse {
    #[schema(value_type = String, example = "DeepFace API is Running. Access /docs for UI.")]
    pub message: &'static str,
}

impl Default for RootResponse {
    fn default() -> Self {
        Self {
            message: ROOT_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AnalyzeResponse {
    #[schema(value_type = String, example = "success")]
    pub status: &'static str,
    pub age: Option<u32>,
    #[schema(value_type = Option<String>, example = "Woman")]
    pub gender: Option<&'static str>,
    #[schema(value_type = Option<String>, example = "neutral")]
    pub emotion: Option<&'static str>,
    #[serde(rename = "box")]
    pub face_box: FaceBox,
}

impl From<&FaceAnalysis> for AnalyzeResponse {
    fn from(record: &FaceAnalysis) -> Self {
        let r = &record.region;
        Self {
            status: "success",
            age: record.age,
            gender: record.dominant_gender(),
            emotion: record.dominant_emotion(),
            face_box: FaceBox {
                x: r.x,
                y: r.y,
                w: r.w.max(0),
                h: r.h.max(0),
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub verified: bool,
    pub distance: f32,
    pub threshold: f32,
    #[schema(example = "VGG-Face")]
    pub model: String,
    #[schema(value_type = String, example = "cosine")]
    pub similarity_metric: DistanceMetric,
}

impl From<Verification> for VerifyResponse {
    fn from(v: Verification) -> Self {
        Self {
            verified: v.verified,
            distance: v.distance,
            threshold: v.threshold,
            model: v.model,
            similarity_metric: v.similarity_metric,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// `{status, message}` envelope shared by errors and the represent no-face result.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StatusMessage {
    #[schema(value_type = String, example = "error")]
    pub status: &'static str,
    pub message: String,
}

impl StatusMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }

    pub fn no_face() -> Self {
        Self {
            status: "failed",
            message: NO_FACE_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum RepresentResponse {
    Embedding(EmbeddingResponse),
    Failed(StatusMessage),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(value_type = String, example = "ok")]
    pub status: &'static str,
    #[schema(value_type = String)]
    pub version: &'static str,
    pub workers: usize,
    pub models: Vec<String>,
}

/// Everything a handler can fail with.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{field}: {source}")]
    InvalidImage {
        field: &'static str,
        #[source]
        source: InvalidImageError,
    },
    #[error("malformed multipart body: {message}")]
    Multipart { status: StatusCode, message: String },
    #[error("missing multipart field `{0}`")]
    MissingField(&'static str),
    #[error("{0}")]
    Inference(#[from] EngineError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        Self::Multipart {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

/// How inference failures map onto HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Inference failures answer 200 with the error envelope.
    Compatible,
    /// Inference failures answer 500.
    Strict,
}

impl ErrorPolicy {
    pub fn status_for(&self, err: &ApiError) -> StatusCode {
        match err {
            ApiError::InvalidImage { .. } => StatusCode::BAD_REQUEST,
            ApiError::Multipart { status, .. } if status.is_client_error() => *status,
            ApiError::Multipart { .. } => StatusCode::BAD_REQUEST,
            ApiError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Inference(_) | ApiError::Internal(_) => match self {
                ErrorPolicy::Compatible => StatusCode::OK,
                ErrorPolicy::Strict => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Turn a handler error into its final response.
    pub fn reject(&self, err: ApiError) -> Rejection {
        let status = self.status_for(&err);
        if status.is_client_error() {
            tracing::warn!(%status, error = %err, "request rejected");
        } else {
            tracing::error!(%status, error = %err, "request failed");
        }
        Rejection {
            status,
            body: StatusMessage::error(err.to_string()),
        }
    }
}

/// An error envelope paired with its status code.
#[derive(Debug)]
pub struct Rejection {
    pub status: StatusCode,
    pub body: StatusMessage,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
