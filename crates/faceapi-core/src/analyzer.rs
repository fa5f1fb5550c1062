//! The face-analysis collaborator: analyze, verify and represent.
//!
//! [`FaceAnalyzer`] is the seam the HTTP daemon and the CLI call through.
//! [`OnnxAnalyzer`] implements it with SCRFD detection, a catalog
//! recognition model and the attribute classifiers.

use crate::attributes::{AttributeError, AttributeModels};
use crate::catalog::{self, AttributeKind, CatalogError, RecognitionModel, Thresholds};
use crate::detector::{self, DetectorError, FaceDetector};
use crate::ingest::DecodedImage;
use crate::preprocess;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{
    closest_pair, BoundingBox, DistanceMetric, Embedding, FaceAnalysis, Representation,
    Verification, VerifiedAreas,
};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attributes: {0}")]
    Attribute(#[from] AttributeError),
    #[error("face could not be detected in {0}; disable strict detection to use the whole image")]
    NoFaceDetected(String),
    #[error("recognition model {0} is not loaded")]
    ModelNotLoaded(RecognitionModel),
    #[error("attribute classifiers are not loaded")]
    AttributesNotLoaded,
    #[error("no actions requested; expected any of age, gender, emotion")]
    NoActions,
}

/// Which attributes `analyze` should compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions {
    pub age: bool,
    pub gender: bool,
    pub emotion: bool,
}

impl Actions {
    pub fn all() -> Self {
        Self {
            age: true,
            gender: true,
            emotion: true,
        }
    }

    /// Build from action names ("age", "gender", "emotion").
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut actions = Self {
            age: false,
            gender: false,
            emotion: false,
        };
        for name in names {
            match name.as_ref().parse::<AttributeKind>()? {
                AttributeKind::Age => actions.age = true,
                AttributeKind::Gender => actions.gender = true,
                AttributeKind::Emotion => actions.emotion = true,
            }
        }
        Ok(actions)
    }

    pub fn is_empty(&self) -> bool {
        !(self.age || self.gender || self.emotion)
    }
}

impl Default for Actions {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub actions: Actions,
    /// Raise [`AnalyzerError::NoFaceDetected`] instead of falling back to the whole image.
    pub enforce_detection: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            actions: Actions::all(),
            enforce_detection: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub model: RecognitionModel,
    pub metric: DistanceMetric,
    pub enforce_detection: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            model: RecognitionModel::VggFace,
            metric: DistanceMetric::Cosine,
            enforce_detection: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepresentOptions {
    pub model: RecognitionModel,
    /// With strict detection off, an image without faces yields an empty list.
    pub enforce_detection: bool,
}

impl Default for RepresentOptions {
    fn default() -> Self {
        Self {
            model: RecognitionModel::VggFace,
            enforce_detection: true,
        }
    }
}

/// Face analysis operations. Implementations are used from one thread at a
/// time and may keep mutable inference state.
pub trait FaceAnalyzer {
    /// One record per detected face, most confident first.
    fn analyze(
        &mut self,
        image: &DecodedImage,
        options: &AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, AnalyzerError>;

    /// Compare the closest pair of faces across two images.
    fn verify(
        &mut self,
        img1: &DecodedImage,
        img2: &DecodedImage,
        options: &VerifyOptions,
    ) -> Result<Verification, AnalyzerError>;

    /// One L2-normalized embedding per detected face, most confident first.
    fn represent(
        &mut self,
        image: &DecodedImage,
        options: &RepresentOptions,
    ) -> Result<Vec<Representation>, AnalyzerError>;

    /// Names of the loaded models, for status reporting.
    fn loaded_models(&self) -> Vec<String>;
}

/// What stands in for the detections when the detector found nothing and
/// strict detection is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoFaceFallback {
    /// One region covering the whole image (analyze, verify).
    WholeImage,
    /// No regions at all (represent).
    Nothing,
}

/// Apply the strict-detection policy to a detector result.
fn faces_or_fallback(
    detected: Vec<BoundingBox>,
    image: &DecodedImage,
    enforce_detection: bool,
    fallback: NoFaceFallback,
    label: &str,
) -> Result<Vec<BoundingBox>, AnalyzerError> {
    if !detected.is_empty() {
        return Ok(detected);
    }
    if enforce_detection {
        return Err(AnalyzerError::NoFaceDetected(label.to_string()));
    }
    tracing::debug!(label, ?fallback, "no face detected");
    Ok(match fallback {
        NoFaceFallback::WholeImage => vec![BoundingBox::whole_image(image.width(), image.height())],
        NoFaceFallback::Nothing => Vec::new(),
    })
}

/// Best face pair across two images, judged against a model's thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PairVerdict {
    img1: usize,
    img2: usize,
    distance: f32,
    threshold: f32,
    verified: bool,
}

/// Compare raw embeddings; the metric decides whether magnitudes matter.
fn judge_pair(
    emb1: &[Embedding],
    emb2: &[Embedding],
    metric: DistanceMetric,
    thresholds: &Thresholds,
) -> Option<PairVerdict> {
    let (img1, img2, distance) = closest_pair(emb1, emb2, metric)?;
    let threshold = thresholds.for_metric(metric);
    Some(PairVerdict {
        img1,
        img2,
        distance,
        threshold,
        verified: distance <= threshold,
    })
}

/// What to load at startup.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub model_dir: PathBuf,
    pub detection_threshold: f32,
    /// May be empty when only `analyze` is needed.
    pub recognition_models: Vec<RecognitionModel>,
    pub with_attributes: bool,
    pub intra_threads: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            model_dir: catalog::default_model_dir(),
            detection_threshold: detector::DEFAULT_CONFIDENCE_THRESHOLD,
            recognition_models: vec![RecognitionModel::VggFace],
            with_attributes: true,
            intra_threads: 2,
        }
    }
}

/// ONNX Runtime implementation of [`FaceAnalyzer`].
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    detector_name: String,
    recognizers: Vec<FaceRecognizer>,
    attributes: Option<AttributeModels>,
}

impl OnnxAnalyzer {
    /// Load every model named by `settings`. Fails if any file is missing.
    pub fn load(settings: &AnalyzerSettings) -> Result<Self, AnalyzerError> {
        let catalog = catalog::catalog()?;
        let dir = &settings.model_dir;

        let detector = FaceDetector::load(
            &dir.join(&catalog.detector.file),
            settings.detection_threshold,
            settings.intra_threads,
        )?;

        let mut recognizers = Vec::with_capacity(settings.recognition_models.len());
        for &model in &settings.recognition_models {
            let entry = catalog.recognition(model)?;
            recognizers.push(FaceRecognizer::load(
                dir,
                model,
                entry,
                settings.intra_threads,
            )?);
        }

        let attributes = if settings.with_attributes {
            Some(AttributeModels::load(dir, catalog, settings.intra_threads)?)
        } else {
            None
        };

        Ok(Self {
            detector,
            detector_name: catalog.detector.name.clone(),
            recognizers,
            attributes,
        })
    }

    fn recognizer(
        &mut self,
        model: RecognitionModel,
    ) -> Result<&mut FaceRecognizer, AnalyzerError> {
        self.recognizers
            .iter_mut()
            .find(|r| r.model() == model)
            .ok_or(AnalyzerError::ModelNotLoaded(model))
    }

    fn faces(
        &mut self,
        image: &DecodedImage,
        enforce_detection: bool,
        fallback: NoFaceFallback,
        label: &str,
    ) -> Result<Vec<BoundingBox>, AnalyzerError> {
        let detected = self.detector.detect(image.as_rgb())?;
        faces_or_fallback(detected, image, enforce_detection, fallback, label)
    }

    fn embed_all(
        &mut self,
        image: &DecodedImage,
        faces: &[BoundingBox],
        model: RecognitionModel,
    ) -> Result<Vec<Embedding>, AnalyzerError> {
        let recognizer = self.recognizer(model)?;
        faces
            .iter()
            .map(|face| {
                recognizer
                    .extract(image.as_rgb(), face)
                    .map_err(AnalyzerError::from)
            })
            .collect()
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(
        &mut self,
        image: &DecodedImage,
        options: &AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, AnalyzerError> {
        let actions = options.actions;
        if actions.is_empty() {
            return Err(AnalyzerError::NoActions);
        }
        if self.attributes.is_none() {
            return Err(AnalyzerError::AttributesNotLoaded);
        }

        let faces = self.faces(
            image,
            options.enforce_detection,
            NoFaceFallback::WholeImage,
            "the image",
        )?;
        let attributes = self
            .attributes
            .as_mut()
            .ok_or(AnalyzerError::AttributesNotLoaded)?;

        let mut results = Vec::with_capacity(faces.len());
        for face in &faces {
            let region = face.facial_area(image.width(), image.height());
            let crop = preprocess::crop(image.as_rgb(), &region);

            results.push(FaceAnalysis {
                region,
                face_confidence: face.confidence,
                age: if actions.age {
                    Some(attributes.age(&crop)?)
                } else {
                    None
                },
                gender: if actions.gender {
                    Some(attributes.gender(&crop)?)
                } else {
                    None
                },
                emotion: if actions.emotion {
                    Some(attributes.emotion(&crop)?)
                } else {
                    None
                },
            });
        }

        tracing::debug!(faces = results.len(), "analyze done");
        Ok(results)
    }

    fn verify(
        &mut self,
        img1: &DecodedImage,
        img2: &DecodedImage,
        options: &VerifyOptions,
    ) -> Result<Verification, AnalyzerError> {
        let started = Instant::now();
        let entry = catalog::catalog()?.recognition(options.model)?;
        // Fail before running detection if the model is absent.
        self.recognizer(options.model)?;

        let enforce = options.enforce_detection;
        let faces1 = self.faces(img1, enforce, NoFaceFallback::WholeImage, "img1")?;
        let faces2 = self.faces(img2, enforce, NoFaceFallback::WholeImage, "img2")?;
        let emb1 = self.embed_all(img1, &faces1, options.model)?;
        let emb2 = self.embed_all(img2, &faces2, options.model)?;

        let verdict = judge_pair(&emb1, &emb2, options.metric, &entry.thresholds)
            .ok_or_else(|| AnalyzerError::NoFaceDetected("img1 or img2".to_string()))?;

        Ok(Verification {
            verified: verdict.verified,
            distance: verdict.distance,
            threshold: verdict.threshold,
            model: options.model.name().to_string(),
            detector_backend: self.detector_name.clone(),
            similarity_metric: options.metric,
            facial_areas: VerifiedAreas {
                img1: faces1[verdict.img1].facial_area(img1.width(), img1.height()),
                img2: faces2[verdict.img2].facial_area(img2.width(), img2.height()),
            },
            time: started.elapsed().as_secs_f32(),
        })
    }

    fn represent(
        &mut self,
        image: &DecodedImage,
        options: &RepresentOptions,
    ) -> Result<Vec<Representation>, AnalyzerError> {
        self.recognizer(options.model)?;

        let faces = self.faces(
            image,
            options.enforce_detection,
            NoFaceFallback::Nothing,
            "the image",
        )?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self.embed_all(image, &faces, options.model)?;
        Ok(faces
            .iter()
            .zip(embeddings)
            .map(|(face, embedding)| Representation {
                embedding: embedding.l2_normalized().values,
                facial_area: face.facial_area(image.width(), image.height()),
                face_confidence: face.confidence,
            })
            .collect())
    }

    fn loaded_models(&self) -> Vec<String> {
        let mut names = vec![self.detector_name.clone()];
        names.extend(self.recognizers.iter().map(|r| r.model().name().to_string()));
        if self.attributes.is_some() {
            names.extend(AttributeKind::ALL.iter().map(|k| k.to_string()));
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn image(width: u32, height: u32) -> DecodedImage {
        DecodedImage::from_rgb(RgbImage::new(width, height)).unwrap()
    }

    fn detection(confidence: f32) -> BoundingBox {
        BoundingBox {
            x: 12.0,
            y: 8.0,
            width: 40.0,
            height: 48.0,
            confidence,
            landmarks: None,
        }
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
        }
    }

    fn thresholds(model: RecognitionModel) -> &'static Thresholds {
        &catalog::catalog().unwrap().recognition(model).unwrap().thresholds
    }

    #[test]
    fn test_actions_from_names() {
        let a = Actions::from_names(&["age", "Emotion"]).unwrap();
        assert!(a.age && a.emotion && !a.gender);
        assert!(Actions::from_names(&["race"]).is_err());
        assert!(Actions::from_names::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_default_options_are_strict() {
        assert!(AnalyzeOptions::default().enforce_detection);
        assert!(RepresentOptions::default().enforce_detection);
        let v = VerifyOptions::default();
        assert_eq!(v.model, RecognitionModel::VggFace);
        assert_eq!(v.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_detections_pass_through() {
        let img = image(64, 64);
        for fallback in [NoFaceFallback::WholeImage, NoFaceFallback::Nothing] {
            let faces =
                faces_or_fallback(vec![detection(0.9), detection(0.6)], &img, true, fallback, "x")
                    .unwrap();
            assert_eq!(faces.len(), 2);
            assert_eq!(faces[0].confidence, 0.9);
        }
    }

    #[test]
    fn test_strict_detection_raises() {
        let img = image(64, 64);
        for fallback in [NoFaceFallback::WholeImage, NoFaceFallback::Nothing] {
            let err = faces_or_fallback(vec![], &img, true, fallback, "img2").unwrap_err();
            assert!(matches!(err, AnalyzerError::NoFaceDetected(ref l) if l == "img2"));
        }
    }

    #[test]
    fn test_lenient_detection_uses_whole_image() {
        let img = image(1, 1);
        let faces =
            faces_or_fallback(vec![], &img, false, NoFaceFallback::WholeImage, "the image")
                .unwrap();
        assert_eq!(faces.len(), 1);
        let area = faces[0].facial_area(1, 1);
        assert_eq!((area.x, area.y, area.w, area.h), (0, 0, 1, 1));
        assert_eq!(faces[0].confidence, 0.0);
        assert!(faces[0].landmarks.is_none());
    }

    #[test]
    fn test_lenient_represent_yields_nothing() {
        let img = image(32, 16);
        let faces =
            faces_or_fallback(vec![], &img, false, NoFaceFallback::Nothing, "the image").unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_same_face_is_verified() {
        let faces = [emb(&[0.3, -1.2, 4.0, 0.7])];
        let vgg = thresholds(RecognitionModel::VggFace);
        for metric in [
            DistanceMetric::Cosine,
            DistanceMetric::Euclidean,
            DistanceMetric::EuclideanL2,
        ] {
            let v = judge_pair(&faces, &faces, metric, vgg).unwrap();
            assert!(v.verified, "{metric}");
            assert!(v.distance.abs() < 1e-5);
        }
    }

    #[test]
    fn test_arcface_euclidean_rejects_opposite_faces() {
        // ArcFace outputs are unnormalized; typical norms are well above the 4.15 threshold.
        let a = [emb(&[18.0, -6.0, 9.0, 3.0])];
        let b = [emb(&[-18.0, 6.0, -9.0, -3.0])];
        let arcface = thresholds(RecognitionModel::ArcFace);

        let raw = judge_pair(&a, &b, DistanceMetric::Euclidean, arcface).unwrap();
        assert!((raw.threshold - 4.15).abs() < 1e-6);
        assert!(raw.distance > raw.threshold, "distance = {}", raw.distance);
        assert!(!raw.verified);

        let l2 = judge_pair(&a, &b, DistanceMetric::EuclideanL2, arcface).unwrap();
        assert!((l2.distance - 2.0).abs() < 1e-5);
        assert!(!l2.verified);
    }

    #[test]
    fn test_closest_pair_wins() {
        let faces1 = [emb(&[1.0, 0.0]), emb(&[0.0, 1.0])];
        let faces2 = [emb(&[-1.0, 0.0]), emb(&[0.1, 1.0])];
        let vgg = thresholds(RecognitionModel::VggFace);
        let v = judge_pair(&faces1, &faces2, DistanceMetric::Cosine, vgg).unwrap();
        assert_eq!((v.img1, v.img2), (1, 1));
        assert!(v.verified);
    }

    #[test]
    fn test_no_embeddings_no_verdict() {
        let t = thresholds(RecognitionModel::VggFace);
        assert!(judge_pair(&[], &[emb(&[1.0])], DistanceMetric::Cosine, t).is_none());
    }

    #[test]
    fn test_load_fails_fast_without_models() {
        let settings = AnalyzerSettings {
            model_dir: PathBuf::from("/nonexistent/faceapi"),
            ..AnalyzerSettings::default()
        };
        let err = OnnxAnalyzer::load(&settings).err().unwrap();
        assert!(matches!(
            err,
            AnalyzerError::Detector(DetectorError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_no_face_message_mentions_image() {
        let err = AnalyzerError::NoFaceDetected("img2".into());
        assert!(err.to_string().contains("img2"));
    }
}
