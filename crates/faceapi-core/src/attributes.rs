//! Age, gender and emotion classifiers.
//!
//! Each classifier is a single-output ONNX graph fed a cropped face:
//! - age: 101-way distribution over years, reduced to its expectation;
//! - gender: [Woman, Man];
//! - emotion: [angry, disgust, fear, happy, sad, surprise, neutral] on grayscale.

use crate::catalog::{AttributeEntry, AttributeKind, Catalog};
use crate::preprocess;
use crate::types::{Emotion, Gender, Prediction};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("{kind} classification failed: {reason}")]
    InferenceFailed { kind: AttributeKind, reason: String },
    #[error("catalog: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One loaded attribute classifier.
pub struct AttributeClassifier {
    session: Session,
    entry: AttributeEntry,
}

impl AttributeClassifier {
    pub fn load(
        model_dir: &Path,
        entry: &AttributeEntry,
        intra_threads: usize,
    ) -> Result<Self, AttributeError> {
        let path = model_dir.join(&entry.file);
        if !path.exists() {
            return Err(AttributeError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(&path)?;

        tracing::info!(
            kind = %entry.kind,
            path = %path.display(),
            classes = entry.classes,
            "loaded attribute classifier"
        );

        Ok(Self {
            session,
            entry: entry.clone(),
        })
    }

    /// Class probabilities for a face crop (any size; it is fitted to the input).
    pub fn probabilities(&mut self, face: &RgbImage) -> Result<Vec<f32>, AttributeError> {
        let kind = self.entry.kind;
        let fitted = preprocess::fit_square(face, self.entry.input.size);
        let input = preprocess::to_tensor(&fitted, &self.entry.input);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed {
                kind,
                reason: e.to_string(),
            })?;

        if raw.len() != self.entry.classes {
            return Err(AttributeError::InferenceFailed {
                kind,
                reason: format!("expected {} classes, got {}", self.entry.classes, raw.len()),
            });
        }

        Ok(preprocess::as_probabilities(raw))
    }
}

/// The three attribute classifiers, loaded together.
pub struct AttributeModels {
    age: AttributeClassifier,
    gender: AttributeClassifier,
    emotion: AttributeClassifier,
}

impl AttributeModels {
    pub fn load(
        model_dir: &Path,
        catalog: &Catalog,
        intra_threads: usize,
    ) -> Result<Self, AttributeError> {
        let load = |kind: AttributeKind| -> Result<AttributeClassifier, AttributeError> {
            AttributeClassifier::load(model_dir, catalog.attribute(kind)?, intra_threads)
        };
        Ok(Self {
            age: load(AttributeKind::Age)?,
            gender: load(AttributeKind::Gender)?,
            emotion: load(AttributeKind::Emotion)?,
        })
    }

    pub fn age(&mut self, face: &RgbImage) -> Result<u32, AttributeError> {
        let probs = self.age.probabilities(face)?;
        Ok(apparent_age(&probs) as u32)
    }

    pub fn gender(&mut self, face: &RgbImage) -> Result<Prediction<Gender>, AttributeError> {
        let probs = self.gender.probabilities(face)?;
        Prediction::from_probabilities(&Gender::ALL, &probs)
            .ok_or_else(|| label_mismatch(AttributeKind::Gender))
    }

    pub fn emotion(&mut self, face: &RgbImage) -> Result<Prediction<Emotion>, AttributeError> {
        let probs = self.emotion.probabilities(face)?;
        Prediction::from_probabilities(&Emotion::ALL, &probs)
            .ok_or_else(|| label_mismatch(AttributeKind::Emotion))
    }
}

fn label_mismatch(kind: AttributeKind) -> AttributeError {
    AttributeError::InferenceFailed {
        kind,
        reason: "class count does not match labels".into(),
    }
}

/// Expected age under a distribution indexed by year (0..=100).
pub fn apparent_age(probabilities: &[f32]) -> f32 {
    probabilities
        .iter()
        .enumerate()
        .map(|(year, p)| year as f32 * p)
        .sum::<f32>()
        .max(0.0)
}
