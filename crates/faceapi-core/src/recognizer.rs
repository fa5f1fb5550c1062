//! Face recognizer via ONNX Runtime.
//!
//! Produces raw embeddings for one catalog recognition model (VGG-Face or
//! ArcFace). Magnitudes are kept so the `euclidean` metric compares against
//! thresholds calibrated on unnormalized vectors. Faces with landmarks are
//! aligned first; whole-image fallback regions are cropped and resized instead.

use crate::alignment;
use crate::catalog::{RecognitionEntry, RecognitionModel};
use crate::preprocess;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("embedding extraction failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
    model: RecognitionModel,
    entry: RecognitionEntry,
}

impl FaceRecognizer {
    /// Load the ONNX graph for `model` from `model_dir`.
    pub fn load(
        model_dir: &Path,
        model: RecognitionModel,
        entry: &RecognitionEntry,
        intra_threads: usize,
    ) -> Result<Self, RecognizerError> {
        let path = model_dir.join(&entry.file);
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(&path)?;

        tracing::info!(
            model = model.name(),
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            dim = entry.embedding_dim,
            "loaded recognition model"
        );

        Ok(Self {
            session,
            model,
            entry: entry.clone(),
        })
    }

    pub fn model(&self) -> RecognitionModel {
        self.model
    }

    /// Extract the raw embedding for one face of `image`.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let crop = face_crop(image, face, self.entry.input.size);
        let input = preprocess::to_tensor(&crop, &self.entry.input);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;

        checked_embedding(raw, self.entry.embedding_dim, self.model)
    }
}

/// Validate a raw model output: expected length, all values finite.
fn checked_embedding(
    raw: &[f32],
    expected: usize,
    model: RecognitionModel,
) -> Result<Embedding, RecognizerError> {
    if raw.len() != expected {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {expected}-dim embedding from {model}, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed(format!(
            "{model} produced a non-finite embedding"
        )));
    }
    Ok(Embedding {
        values: raw.to_vec(),
    })
}

/// Square model input for one face: aligned when landmarks are known,
/// otherwise the clipped box resized with padding.
fn face_crop(image: &RgbImage, face: &BoundingBox, size: usize) -> RgbImage {
    match &face.landmarks {
        Some(landmarks) => alignment::align_face(image, landmarks, size),
        None => {
            let area = face.facial_area(image.width(), image.height());
            preprocess::fit_square(&preprocess::crop(image, &area), size)
        }
    }
}
