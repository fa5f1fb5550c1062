use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// A box covering the whole image, used when detection finds nothing and
    /// strict detection is off. Confidence is zero and there are no landmarks.
    pub fn whole_image(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 0.0,
            landmarks: None,
        }
    }

    /// Integer region clipped to the image bounds.
    pub fn facial_area(&self, image_width: u32, image_height: u32) -> FacialArea {
        let max_x = image_width as f32;
        let max_y = image_height as f32;
        let x1 = self.x.clamp(0.0, max_x);
        let y1 = self.y.clamp(0.0, max_y);
        let x2 = (self.x + self.width).clamp(0.0, max_x);
        let y2 = (self.y + self.height).clamp(0.0, max_y);

        let point = |p: (f32, f32)| (p.0.round() as i32, p.1.round() as i32);

        FacialArea {
            x: x1.round() as i32,
            y: y1.round() as i32,
            w: (x2 - x1).max(0.0).round() as i32,
            h: (y2 - y1).max(0.0).round() as i32,
            left_eye: self.landmarks.map(|lms| point(lms[0])),
            right_eye: self.landmarks.map(|lms| point(lms[1])),
        }
    }
}

/// Face region in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub left_eye: Option<(i32, i32)>,
    pub right_eye: Option<(i32, i32)>,
}

/// Face embedding vector (4096-dimensional for VGG-Face, 512 for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values }
    }

    /// Distance under the given metric. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self
                .l2_normalized()
                .euclidean_distance(&other.l2_normalized()),
        }
    }
}

/// Find the closest pair between two sets of embeddings.
///
/// Returns `(index_in_a, index_in_b, distance)`, or `None` if either set is empty.
/// Every pair is compared.
pub fn closest_pair(
    a: &[Embedding],
    b: &[Embedding],
    metric: DistanceMetric,
) -> Option<(usize, usize, f32)> {
    let mut best: Option<(usize, usize, f32)> = None;
    for (i, ea) in a.iter().enumerate() {
        for (j, eb) in b.iter().enumerate() {
            let d = ea.distance(eb, metric);
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((i, j, d));
            }
        }
    }
    best
}

/// Distance metric used to compare embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Gender classes, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Woman,
    Man,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Woman, Gender::Man];

    pub fn label(&self) -> &'static str {
        match self {
            Gender::Woman => "Woman",
            Gender::Man => "Man",
        }
    }
}

/// Emotion classes, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }
}

/// Per-class scores (percent, summing to ~100) and the highest-scoring class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction<L> {
    pub scores: Vec<(L, f32)>,
    pub dominant: L,
}

impl<L: Copy> Prediction<L> {
    /// Build a prediction from raw probabilities in `labels` order.
    ///
    /// Probabilities are rescaled to percentages. Returns `None` if the
    /// lengths differ or there are no labels.
    pub fn from_probabilities(labels: &[L], probabilities: &[f32]) -> Option<Self> {
        if labels.is_empty() || labels.len() != probabilities.len() {
            return None;
        }
        let total: f32 = probabilities.iter().sum();
        let scale = if total > 0.0 { 100.0 / total } else { 0.0 };

        let scores: Vec<(L, f32)> = labels
            .iter()
            .zip(probabilities)
            .map(|(&l, &p)| (l, p * scale))
            .collect();

        let mut dominant = scores[0];
        for &(label, score) in &scores[1..] {
            if score > dominant.1 {
                dominant = (label, score);
            }
        }

        Some(Self {
            scores,
            dominant: dominant.0,
        })
    }
}

/// Attribute analysis of one face.
///
/// Fields for actions that were not requested are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceAnalysis {
    pub region: FacialArea,
    pub face_confidence: f32,
    pub age: Option<u32>,
    pub gender: Option<Prediction<Gender>>,
    pub emotion: Option<Prediction<Emotion>>,
}

impl FaceAnalysis {
    pub fn dominant_gender(&self) -> Option<&'static str> {
        self.gender.as_ref().map(|p| p.dominant.label())
    }

    pub fn dominant_emotion(&self) -> Option<&'static str> {
        self.emotion.as_ref().map(|p| p.dominant.label())
    }
}

/// Facial areas of the pair that produced the reported distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedAreas {
    pub img1: FacialArea,
    pub img2: FacialArea,
}

/// Outcome of comparing the faces in two images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    pub distance: f32,
    pub threshold: f32,
    pub model: String,
    pub detector_backend: String,
    pub similarity_metric: DistanceMetric,
    pub facial_areas: VerifiedAreas,
    /// Wall-clock seconds spent inside the collaborator.
    pub time: f32,
}

/// Embedding of one detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Representation {
    pub embedding: Vec<f32>,
    pub facial_area: FacialArea,
    pub face_confidence: f32,
}
