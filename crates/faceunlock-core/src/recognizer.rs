//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns an aligned 112×112 RGB face crop into a unit-length 512-d embedding
//! using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::RgbFrame;
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract a unit-length embedding for a detected face.
    pub fn extract(
        &mut self,
        frame: &RgbFrame,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        to_embedding(raw.to_vec())
    }
}

/// Validate the raw model output and L2-normalize it.
fn to_embedding(raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    Ok(Embedding {
        values: raw,
        model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
    }
    .normalized())
}

/// Convert a packed 112×112 RGB crop into a normalized NCHW tensor.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (i, px) in aligned.chunks_exact(3).take(size * size).enumerate() {
        let (y, x) = (i / size, i % size);
        for c in 0..3 {
            tensor[[0, c, y, x]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut aligned = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        // Pixel (x=1, y=0) = pure red
        aligned[3] = 255;
        let tensor = preprocess(&aligned);
        assert!((tensor[[0, 0, 0, 1]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 1]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 1]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_to_embedding_normalizes() {
        let mut raw = vec![0.0f32; ARCFACE_EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        let emb = to_embedding(raw).unwrap();
        assert!((emb.values[0] - 0.6).abs() < 1e-6);
        assert!((emb.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(emb.model_version.as_deref(), Some(ARCFACE_MODEL_VERSION));
    }

    #[test]
    fn test_to_embedding_rejects_wrong_dimension() {
        let err = to_embedding(vec![1.0; 128]).unwrap_err();
        assert!(matches!(err, RecognizerError::InferenceFailed(_)));
    }
}
