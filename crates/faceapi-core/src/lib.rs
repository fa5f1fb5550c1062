//! faceapi-core: image ingestion and face analysis.
//!
//! Decodes uploads into RGB pixel arrays and runs SCRFD detection, face
//! recognition (VGG-Face / ArcFace) and age, gender and emotion classifiers
//! via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod analyzer;
pub mod attributes;
pub mod catalog;
pub mod detector;
pub mod ingest;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use analyzer::{
    Actions, AnalyzeOptions, AnalyzerError, AnalyzerSettings, FaceAnalyzer, OnnxAnalyzer,
    RepresentOptions, VerifyOptions,
};
pub use catalog::{default_model_dir, RecognitionModel};
pub use ingest::{decode, DecodedImage, InvalidImageError};
pub use types::{
    BoundingBox, DistanceMetric, Embedding, Emotion, FaceAnalysis, FacialArea, Gender, Prediction,
    Representation, Verification, VerifiedAreas,
};
