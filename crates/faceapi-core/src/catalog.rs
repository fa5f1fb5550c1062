//! Model catalog.
//!
//! Maps each model the analyzer can load to its file name, input tensor
//! description and (for recognition models) per-metric verification
//! thresholds. The catalog is embedded at compile time from
//! `contrib/models.toml`.

use crate::types::DistanceMetric;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

const MODELS_TOML: &str = include_str!("../../../contrib/models.toml");

static CATALOG: OnceLock<Result<Catalog, String>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("bad model catalog: {0}")]
    Parse(String),
    #[error("model {0} is not in the catalog")]
    Missing(String),
}

/// Tensor layout expected by an exported graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Nchw,
    Nhwc,
}

/// Channel order fed to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    Rgb,
    Bgr,
    Gray,
}

impl ColorOrder {
    pub fn channels(&self) -> usize {
        match self {
            ColorOrder::Gray => 1,
            ColorOrder::Rgb | ColorOrder::Bgr => 3,
        }
    }
}

/// Square input tensor description: pixels are fed as `(value - mean) / std`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InputSpec {
    pub size: usize,
    pub layout: Layout,
    pub color: ColorOrder,
    pub mean: f32,
    pub std: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorEntry {
    pub name: String,
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    pub cosine: f32,
    pub euclidean: f32,
    pub euclidean_l2: f32,
}

impl Thresholds {
    pub fn for_metric(&self, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => self.cosine,
            DistanceMetric::Euclidean => self.euclidean,
            DistanceMetric::EuclideanL2 => self.euclidean_l2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionEntry {
    pub name: String,
    pub file: String,
    pub embedding_dim: usize,
    pub input: InputSpec,
    pub thresholds: Thresholds,
}

/// Which face attribute a classifier predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Age,
    Gender,
    Emotion,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 3] = [
        AttributeKind::Age,
        AttributeKind::Gender,
        AttributeKind::Emotion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Age => "age",
            AttributeKind::Gender => "gender",
            AttributeKind::Emotion => "emotion",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(AttributeKind::Age),
            "gender" => Ok(AttributeKind::Gender),
            "emotion" => Ok(AttributeKind::Emotion),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeEntry {
    pub kind: AttributeKind,
    pub file: String,
    pub classes: usize,
    pub input: InputSpec,
}

/// Top-level catalog structure of `contrib/models.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub detector: DetectorEntry,
    pub recognition: Vec<RecognitionEntry>,
    pub attribute: Vec<AttributeEntry>,
}

impl Catalog {
    pub fn recognition(&self, model: RecognitionModel) -> Result<&RecognitionEntry, CatalogError> {
        self.recognition
            .iter()
            .find(|e| e.name == model.name())
            .ok_or_else(|| CatalogError::Missing(model.name().to_string()))
    }

    pub fn attribute(&self, kind: AttributeKind) -> Result<&AttributeEntry, CatalogError> {
        self.attribute
            .iter()
            .find(|e| e.kind == kind)
            .ok_or_else(|| CatalogError::Missing(kind.to_string()))
    }
}

/// The embedded catalog, parsed on first use.
pub fn catalog() -> Result<&'static Catalog, CatalogError> {
    CATALOG
        .get_or_init(|| toml::from_str::<Catalog>(MODELS_TOML).map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| CatalogError::Parse(e.clone()))
}

/// Face recognition models the analyzer knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognitionModel {
    VggFace,
    ArcFace,
}

impl RecognitionModel {
    pub const ALL: [RecognitionModel; 2] = [RecognitionModel::VggFace, RecognitionModel::ArcFace];

    pub fn name(&self) -> &'static str {
        match self {
            RecognitionModel::VggFace => "VGG-Face",
            RecognitionModel::ArcFace => "ArcFace",
        }
    }
}

impl fmt::Display for RecognitionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecognitionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecognitionModel::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown recognition model: {s}"))
    }
}

/// One model file the analyzer expects to find on disk.
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub label: String,
    pub path: PathBuf,
}

impl ModelFile {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Every file needed to load the detector, the given recognition models and
/// all attribute classifiers from `model_dir`.
pub fn required_files(
    model_dir: &Path,
    models: &[RecognitionModel],
    with_attributes: bool,
) -> Result<Vec<ModelFile>, CatalogError> {
    let catalog = catalog()?;
    let mut files = vec![ModelFile {
        label: catalog.detector.name.clone(),
        path: model_dir.join(&catalog.detector.file),
    }];

    for &model in models {
        let entry = catalog.recognition(model)?;
        files.push(ModelFile {
            label: entry.name.clone(),
            path: model_dir.join(&entry.file),
        });
    }

    if with_attributes {
        for kind in AttributeKind::ALL {
            let entry = catalog.attribute(kind)?;
            files.push(ModelFile {
                label: kind.to_string(),
                path: model_dir.join(&entry.file),
            });
        }
    }

    Ok(files)
}

/// Default model directory: `$XDG_DATA_HOME/faceapi/models`, falling back to
/// `~/.local/share/faceapi/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceapi")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_catalog_parses() {
        let c = catalog().unwrap();
        assert_eq!(c.detector.file, "det_10g.onnx");
        assert_eq!(c.recognition.len(), 2);
        assert_eq!(c.attribute.len(), 3);
    }

    #[test]
    fn test_vgg_face_entry() {
        let entry = catalog().unwrap().recognition(RecognitionModel::VggFace).unwrap();
        assert_eq!(entry.embedding_dim, 4096);
        assert_eq!(entry.input.size, 224);
        assert_eq!(entry.input.layout, Layout::Nhwc);
        assert!((entry.thresholds.for_metric(DistanceMetric::Cosine) - 0.68).abs() < 1e-6);
    }

    #[test]
    fn test_every_model_and_attribute_is_listed() {
        let c = catalog().unwrap();
        for model in RecognitionModel::ALL {
            assert!(c.recognition(model).is_ok(), "{model} missing");
        }
        for kind in AttributeKind::ALL {
            assert!(c.attribute(kind).is_ok(), "{kind} missing");
        }
    }

    #[test]
    fn test_emotion_input_is_grayscale() {
        let entry = catalog().unwrap().attribute(AttributeKind::Emotion).unwrap();
        assert_eq!(entry.input.color, ColorOrder::Gray);
        assert_eq!(entry.input.color.channels(), 1);
        assert_eq!(entry.classes, 7);
    }

    #[test]
    fn test_recognition_model_parse() {
        assert_eq!("vgg-face".parse::<RecognitionModel>(), Ok(RecognitionModel::VggFace));
        assert_eq!("ArcFace".parse::<RecognitionModel>(), Ok(RecognitionModel::ArcFace));
        assert!("Facenet".parse::<RecognitionModel>().is_err());
    }

    #[test]
    fn test_required_files() {
        let dir = Path::new("/models");
        let files = required_files(dir, &[RecognitionModel::VggFace], true).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(names.len(), 5);
        assert_eq!(names[0], dir.join("det_10g.onnx"));
        assert_eq!(names[1], dir.join("vgg_face_weights.onnx"));

        let files = required_files(dir, &[], false).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(" Emotion ".parse::<AttributeKind>(), Ok(AttributeKind::Emotion));
        assert!("race".parse::<AttributeKind>().is_err());
    }
}
