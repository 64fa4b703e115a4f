use serde::{Deserialize, Serialize};

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
    /// Box area in pixels; degenerate boxes report 0.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity between two embeddings, in [-1, 1].
    ///
    /// For unit-length embeddings this equals their dot product. A zero-norm
    /// side yields 0.0.
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

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Whether two embeddings live in the same space: equal length and, when
    /// both record one, the same model version.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        let same_model = match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same_model && self.values.len() == other.values.len()
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

/// An enrolled reference face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against the reference gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate; 0.0 when the gallery is empty.
    pub similarity: f32,
    /// Name of the matched reference, only set when `matched`.
    pub name: Option<String>,
}

impl MatchResult {
    /// A failed match with the given score.
    pub fn rejected(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            name: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Always iterates every gallery entry and keeps the maximum; a match
/// requires the best similarity to be strictly above the threshold.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, reference) in gallery.iter().enumerate() {
            if !probe.is_comparable(&reference.embedding) {
                tracing::warn!(
                    name = %reference.name,
                    probe_model = probe.model_version.as_deref().unwrap_or("-"),
                    reference_model = reference.embedding.model_version.as_deref().unwrap_or("-"),
                    probe_dim = probe.values.len(),
                    reference_dim = reference.embedding.values.len(),
                    "skipping reference from a different embedding model"
                );
                continue;
            }
            let sim = probe.similarity(&reference.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim > threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                name: Some(gallery[idx].name.clone()),
            },
            Some(_) => MatchResult::rejected(best_sim),
            None => MatchResult::rejected(0.0),
        }
    }
}
