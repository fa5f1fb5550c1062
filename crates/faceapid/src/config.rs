use faceapi_core::{AnalyzerSettings, DistanceMetric, RecognitionModel};
use std::path::PathBuf;

use crate::response::ErrorPolicy;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Listen address (default: 0.0.0.0:8000).
    pub bind_addr: String,
    /// Number of engine worker threads, each with its own model sessions.
    pub workers: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// SCRFD confidence threshold.
    pub detection_threshold: f32,
    /// Distance metric used by /verify.
    pub distance_metric: DistanceMetric,
    /// Maximum accepted request body in bytes.
    pub body_limit_bytes: usize,
    /// Pending requests each worker queue holds before senders wait.
    pub queue_depth: usize,
    /// Map inference failures to 500 instead of 200.
    pub strict_status: bool,
}

impl Config {
    /// Load configuration from `FACEAPI_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("FACEAPI_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(faceapi_core::default_model_dir);

        let distance_metric = match lookup("FACEAPI_DISTANCE_METRIC") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "invalid FACEAPI_DISTANCE_METRIC; using cosine");
                DistanceMetric::Cosine
            }),
            None => DistanceMetric::Cosine,
        };

        Self {
            model_dir,
            bind_addr: lookup("FACEAPI_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            workers: parse_or(&lookup, "FACEAPI_WORKERS", 1usize).max(1),
            intra_threads: parse_or(&lookup, "FACEAPI_INTRA_THREADS", 2usize).max(1),
            detection_threshold: parse_or(
                &lookup,
                "FACEAPI_DETECTION_THRESHOLD",
                faceapi_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            ),
            distance_metric,
            body_limit_bytes: parse_or(&lookup, "FACEAPI_BODY_LIMIT_BYTES", 16 * 1024 * 1024usize),
            queue_depth: parse_or(&lookup, "FACEAPI_QUEUE_DEPTH", 4usize).max(1),
            strict_status: lookup("FACEAPI_STRICT_STATUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    /// Models every engine worker loads at startup.
    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            model_dir: self.model_dir.clone(),
            detection_threshold: self.detection_threshold,
            recognition_models: vec![RecognitionModel::VggFace],
            with_attributes: true,
            intra_threads: self.intra_threads,
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        if self.strict_status {
            ErrorPolicy::Strict
        } else {
            ErrorPolicy::Compatible
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
