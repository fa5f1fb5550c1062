//! HTTP surface: ingest → infer → format, with one error exit.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceapi_core::{
    AnalyzeOptions, DecodedImage, DistanceMetric, RecognitionModel, RepresentOptions,
    VerifyOptions,
};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use utoipa_redoc::{Redoc, Servable};

use crate::engine::{EmbeddingOutcome, EngineHandle};
use crate::response::{
    AnalyzeResponse, ApiError, EmbeddingResponse, ErrorPolicy, FaceBox, HealthResponse, Rejection,
    RepresentResponse, RootResponse, StatusMessage, VerifyResponse,
};

/// Process-wide context shared by every handler.
pub struct AppState {
    pub engine: EngineHandle,
    pub policy: ErrorPolicy,
    pub metric: DistanceMetric,
}

#[derive(OpenApi)]
#[openapi(
    paths(root, health, analyze, verify, represent),
    components(schemas(
        RootResponse,
        HealthResponse,
        AnalyzeResponse,
        FaceBox,
        VerifyResponse,
        EmbeddingResponse,
        StatusMessage,
        RepresentResponse,
        ImageUpload,
        ImagePairUpload,
    )),
    tags((name = "faceapi", description = "Face analysis, verification and embeddings"))
)]
pub struct ApiDoc;

/// Multipart form carrying one image in `file`.
#[derive(ToSchema)]
#[allow(dead_code)]
struct ImageUpload {
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

/// Multipart form carrying the two images to compare.
#[derive(ToSchema)]
#[allow(dead_code)]
struct ImagePairUpload {
    #[schema(value_type = String, format = Binary)]
    img1: Vec<u8>,
    #[schema(value_type = String, format = Binary)]
    img2: Vec<u8>,
}

pub fn build_router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/verify", post(verify))
        .route("/represent", post(represent))
        .route("/openapi.json", get(openapi))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .merge(Redoc::with_url("/docs", ApiDoc::openapi()))
}

/// One multipart file part, buffered in memory.
#[derive(Debug)]
pub struct UploadedImage {
    pub field: &'static str,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Buffer the parts named in `wanted`, in that order. Other parts are skipped.
pub async fn read_uploads(
    multipart: Result<Multipart, MultipartRejection>,
    wanted: &[&'static str],
) -> Result<Vec<UploadedImage>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::Multipart {
        status: e.status(),
        message: e.body_text(),
    })?;

    let mut found: Vec<UploadedImage> = Vec::with_capacity(wanted.len());
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field
            .name()
            .and_then(|n| wanted.iter().copied().find(|w| *w == n))
        else {
            continue;
        };
        if found.iter().any(|u| u.field == name) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;
        tracing::debug!(field = name, ?file_name, len = bytes.len(), "received upload");
        found.push(UploadedImage {
            field: name,
            content_type,
            bytes,
        });
    }

    let mut ordered = Vec::with_capacity(wanted.len());
    for name in wanted {
        let pos = found
            .iter()
            .position(|u| u.field == *name)
            .ok_or(ApiError::MissingField(*name))?;
        ordered.push(found.swap_remove(pos));
    }
    Ok(ordered)
}

/// Decode off the async runtime.
pub async fn decode_upload(upload: UploadedImage) -> Result<DecodedImage, ApiError> {
    let field = upload.field;
    let decoded = tokio::task::spawn_blocking(move || {
        faceapi_core::decode(&upload.bytes, upload.content_type.as_deref())
    })
    .await
    .map_err(|e| ApiError::Internal(format!("decode task failed: {e}")))?;

    let image = decoded.map_err(|source| ApiError::InvalidImage { field, source })?;
    tracing::debug!(
        field,
        width = image.width(),
        height = image.height(),
        "decoded upload"
    );
    Ok(image)
}

async fn single_image(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<DecodedImage, ApiError> {
    let mut uploads = read_uploads(multipart, &["file"]).await?;
    let upload = uploads.pop().ok_or(ApiError::MissingField("file"))?;
    decode_upload(upload).await
}

#[utoipa::path(
    get,
    path = "/",
    tag = "faceapi",
    responses((status = 200, description = "Service banner", body = RootResponse))
)]
async fn root() -> Json<RootResponse> {
    Json(RootResponse::default())
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "faceapi",
    responses((status = 200, description = "Workers and loaded models", body = HealthResponse))
)]
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: state.engine.workers(),
        models: state.engine.models().to_vec(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/analyze",
    tag = "faceapi",
    request_body(content = ImageUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Attributes of the top face", body = AnalyzeResponse),
        (status = 400, description = "Not a decodable image", body = StatusMessage),
        (status = 422, description = "No `file` part", body = StatusMessage),
    )
)]
#[tracing::instrument(skip_all)]
async fn analyze(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalyzeResponse>, Rejection> {
    let run = async {
        let image = single_image(multipart).await?;
        let options = AnalyzeOptions {
            enforce_detection: false,
            ..AnalyzeOptions::default()
        };
        let record = state.engine.analyze(image, options).await?;
        Ok::<_, ApiError>(AnalyzeResponse::from(&record))
    };

    let response = run.await.map_err(|e| state.policy.reject(e))?;
    tracing::info!(
        age = ?response.age,
        gender = ?response.gender,
        emotion = ?response.emotion,
        "analyzed"
    );
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/verify",
    tag = "faceapi",
    request_body(content = ImagePairUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Closest face pair under VGG-Face", body = VerifyResponse),
        (status = 400, description = "Not a decodable image", body = StatusMessage),
        (status = 422, description = "No `img1` or `img2` part", body = StatusMessage),
    )
)]
#[tracing::instrument(skip_all)]
async fn verify(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VerifyResponse>, Rejection> {
    let run = async {
        let mut uploads = read_uploads(multipart, &["img1", "img2"]).await?.into_iter();
        let (Some(first), Some(second)) = (uploads.next(), uploads.next()) else {
            return Err(ApiError::Internal("upload bookkeeping mismatch".into()));
        };
        let img1 = decode_upload(first).await?;
        let img2 = decode_upload(second).await?;

        let options = VerifyOptions {
            model: RecognitionModel::VggFace,
            metric: state.metric,
            enforce_detection: false,
        };
        let verification = state.engine.verify(img1, img2, options).await?;
        Ok::<_, ApiError>(VerifyResponse::from(verification))
    };

    let response = run.await.map_err(|e| state.policy.reject(e))?;
    tracing::info!(
        verified = response.verified,
        distance = response.distance,
        threshold = response.threshold,
        "verified"
    );
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/represent",
    tag = "faceapi",
    request_body(content = ImageUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Embedding, or the no-face result", body = RepresentResponse),
        (status = 400, description = "Not a decodable image", body = StatusMessage),
        (status = 422, description = "No `file` part", body = StatusMessage),
    )
)]
#[tracing::instrument(skip_all)]
async fn represent(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RepresentResponse>, Rejection> {
    let run = async {
        let image = single_image(multipart).await?;
        let options = RepresentOptions {
            model: RecognitionModel::VggFace,
            enforce_detection: false,
        };
        Ok::<_, ApiError>(state.engine.represent(image, options).await?)
    };

    match run.await.map_err(|e| state.policy.reject(e))? {
        EmbeddingOutcome::Embedding(embedding) => {
            tracing::info!(dim = embedding.len(), "represented");
            Ok(Json(RepresentResponse::Embedding(EmbeddingResponse { embedding })))
        }
        EmbeddingOutcome::NoFaceDetected => {
            tracing::info!("represent found no face");
            Ok(Json(RepresentResponse::Failed(StatusMessage::no_face())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use faceapi_core::{
        AnalyzerError, Emotion, FaceAnalysis, FaceAnalyzer, FacialArea, Gender, Prediction,
        Representation, Verification, VerifiedAreas,
    };
    use http_body_util::BodyExt;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BOUNDARY: &str = "faceapi-test-boundary";

    /// Treats any image with a non-black pixel as one face filling the frame.
    struct StubAnalyzer {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    fn has_face(image: &DecodedImage) -> bool {
        image.as_rgb().pixels().any(|p| p.0 != [0, 0, 0])
    }

    fn whole(image: &DecodedImage) -> FacialArea {
        FacialArea {
            x: 0,
            y: 0,
            w: image.width() as i32,
            h: image.height() as i32,
            left_eye: None,
            right_eye: None,
        }
    }

    impl FaceAnalyzer for StubAnalyzer {
        fn analyze(
            &mut self,
            image: &DecodedImage,
            _: &AnalyzeOptions,
        ) -> Result<Vec<FaceAnalysis>, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AnalyzerError::AttributesNotLoaded);
            }
            Ok(vec![FaceAnalysis {
                region: whole(image),
                face_confidence: 0.0,
                age: Some(27),
                gender: Prediction::from_probabilities(&Gender::ALL, &[0.8, 0.2]),
                emotion: Prediction::from_probabilities(
                    &Emotion::ALL,
                    &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
                ),
            }])
        }

        fn verify(
            &mut self,
            img1: &DecodedImage,
            img2: &DecodedImage,
            options: &VerifyOptions,
        ) -> Result<Verification, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let distance = if img1.as_rgb() == img2.as_rgb() { 0.0 } else { 0.9 };
            Ok(Verification {
                verified: distance <= 0.68,
                distance,
                threshold: 0.68,
                model: options.model.name().to_string(),
                detector_backend: "stub".into(),
                similarity_metric: options.metric,
                facial_areas: VerifiedAreas {
                    img1: whole(img1),
                    img2: whole(img2),
                },
                time: 0.0,
            })
        }

        fn represent(
            &mut self,
            image: &DecodedImage,
            _: &RepresentOptions,
        ) -> Result<Vec<Representation>, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !has_face(image) {
                return Ok(vec![]);
            }
            let v = 1.0 / (4096f32).sqrt();
            Ok(vec![Representation {
                embedding: vec![v; 4096],
                facial_area: whole(image),
                face_confidence: 0.9,
            }])
        }

        fn loaded_models(&self) -> Vec<String> {
            vec!["scrfd".into(), "VGG-Face".into()]
        }
    }

    fn app(policy: ErrorPolicy, fail: bool) -> (Router, Arc<AtomicUsize>) {
        app_with_limit(policy, fail, 1024 * 1024)
    }

    fn app_with_limit(
        policy: ErrorPolicy,
        fail: bool,
        body_limit: usize,
    ) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = spawn_engine(1, 4, move |_| {
            Ok(StubAnalyzer {
                calls: counter.clone(),
                fail,
            })
        })
        .unwrap();
        let state = Arc::new(AppState {
            engine,
            policy,
            metric: DistanceMetric::Cosine,
        });
        (build_router(state, body_limit), calls)
    }

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn multipart(path: &str, parts: &[(&str, &str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, content_type, bytes) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.bin\"\r\n"
            );
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(path)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_root() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "DeepFace API is Running. Access /docs for UI.");
    }

    #[tokio::test]
    async fn test_health_lists_models() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workers"], 1);
        assert_eq!(body["models"][1], "VGG-Face");
    }

    #[tokio::test]
    async fn test_analyze_single_black_pixel() {
        let (app, calls) = app(ErrorPolicy::Compatible, false);
        let image = png(1, 1, [0, 0, 0]);
        let req = multipart("/analyze", &[("file", "image/png", image.as_slice())]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert!(body["age"].as_u64().is_some());
        assert_eq!(body["gender"], "Woman");
        assert_eq!(body["emotion"], "neutral");
        assert_eq!(body["box"], serde_json::json!({"x": 0, "y": 0, "w": 1, "h": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_text_upload_rejected_everywhere() {
        let text: &[u8] = b"definitely not an image";
        let cases: [(&str, Vec<(&str, &str, &[u8])>); 3] = [
            ("/analyze", vec![("file", "text/plain", text)]),
            ("/represent", vec![("file", "text/plain", text)]),
            ("/verify", vec![("img1", "text/plain", text), ("img2", "text/plain", text)]),
        ];

        for (path, parts) in cases {
            let (app, calls) = app(ErrorPolicy::Compatible, false);
            let (status, body) = send(app, multipart(path, &parts)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().contains("not a valid image"));
            assert_eq!(calls.load(Ordering::SeqCst), 0, "{path} reached the analyzer");
        }
    }

    #[tokio::test]
    async fn test_verify_same_image() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let image = png(8, 8, [200, 150, 100]);
        let req = multipart(
            "/verify",
            &[
                ("img1", "image/png", image.as_slice()),
                ("img2", "image/png", image.as_slice()),
            ],
        );
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert_eq!(body["model"], "VGG-Face");
        assert_eq!(body["similarity_metric"], "cosine");
        assert!(body.get("status").is_none());
        assert!(body.get("facial_areas").is_none());
    }

    #[tokio::test]
    async fn test_verify_second_image_invalid() {
        let (app, calls) = app(ErrorPolicy::Compatible, false);
        let image = png(4, 4, [10, 10, 10]);
        let req = multipart(
            "/verify",
            &[
                ("img1", "image/png", image.as_slice()),
                ("img2", "image/png", &b"garbage"[..]),
            ],
        );
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().starts_with("img2"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_represent_no_face() {
        let (app, _) = app(ErrorPolicy::Strict, false);
        let image = png(16, 16, [0, 0, 0]);
        let req = multipart("/represent", &[("file", "image/png", image.as_slice())]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"status": "failed", "message": "No face detected"}));
    }

    #[tokio::test]
    async fn test_represent_face() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let image = png(16, 16, [180, 120, 90]);
        let req = multipart("/represent", &[("file", "image/png", image.as_slice())]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::OK);
        let embedding = body["embedding"].as_array().unwrap();
        assert_eq!(embedding.len(), 4096);
        assert!(embedding.iter().all(|v| v.as_f64().is_some_and(f64::is_finite)));
    }

    #[tokio::test]
    async fn test_missing_field() {
        let (app, calls) = app(ErrorPolicy::Compatible, false);
        let image = png(2, 2, [1, 2, 3]);
        let req = multipart("/verify", &[("img1", "image/png", image.as_slice())]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("img2"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_multipart() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let req = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_inference_failure_status_policy() {
        let image = png(2, 2, [50, 60, 70]);
        for (policy, expected) in [
            (ErrorPolicy::Compatible, StatusCode::OK),
            (ErrorPolicy::Strict, StatusCode::INTERNAL_SERVER_ERROR),
        ] {
            let (app, calls) = app(policy, true);
            let req = multipart("/analyze", &[("file", "image/png", image.as_slice())]);
            let (status, body) = send(app, req).await;
            assert_eq!(status, expected);
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().contains("attribute classifiers"));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_extra_fields_ignored() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let image = png(3, 3, [9, 9, 9]);
        let req = multipart(
            "/analyze",
            &[
                ("note", "text/plain", &b"hello"[..]),
                ("file", "image/png", image.as_slice()),
            ],
        );
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["box"]["w"], 3);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (app, calls) = app_with_limit(ErrorPolicy::Compatible, false, 1024);
        let noise = vec![0xAB_u8; 4096];
        let req = multipart("/analyze", &[("file", "image/png", noise.as_slice())]);
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["status"], "error");
        assert!(body["message"].is_string());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_docs_page_served() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let req = Request::builder().uri("/docs").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8_lossy(&bytes);
        assert!(page.contains("/represent"));
    }

    #[tokio::test]
    async fn test_openapi_lists_routes() {
        let (app, _) = app(ErrorPolicy::Compatible, false);
        let req = Request::builder().uri("/openapi.json").body(Body::empty()).unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        for path in ["/", "/health", "/analyze", "/verify", "/represent"] {
            assert!(body["paths"].get(path).is_some(), "{path} undocumented");
        }
        assert!(body["paths"]["/analyze"]["post"]["requestBody"]["content"]
            .get("multipart/form-data")
            .is_some());
    }
}
