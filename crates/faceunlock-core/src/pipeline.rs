//! Detect-then-embed pipeline.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::RgbFrame;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The embedding of the face chosen from a frame, plus where it was found.
#[derive(Debug, Clone)]
pub struct FaceCapture {
    pub embedding: Embedding,
    pub face: BoundingBox,
}

/// Turns a frame into the embedding of its main face.
///
/// `Ok(None)` means no face was detected.
pub trait FacePipeline: Send {
    fn embed(&mut self, frame: &RgbFrame) -> Result<Option<FaceCapture>, PipelineError>;
}

/// SCRFD + ArcFace pipeline running on ONNX Runtime.
pub struct OnnxPipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxPipeline {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    /// Load both models.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, PipelineError> {
        Ok(Self::new(
            FaceDetector::load(detector_path)?,
            FaceRecognizer::load(recognizer_path)?,
        ))
    }
}

impl FacePipeline for OnnxPipeline {
    fn embed(&mut self, frame: &RgbFrame) -> Result<Option<FaceCapture>, PipelineError> {
        let faces = self.detector.detect(frame)?;
        let Some(face) = select_face(&faces) else {
            return Ok(None);
        };
        tracing::debug!(
            detected = faces.len(),
            confidence = face.confidence,
            area = face.area(),
            "face selected"
        );
        let embedding = self.recognizer.extract(frame, face)?;
        Ok(Some(FaceCapture {
            embedding,
            face: face.clone(),
        }))
    }
}

/// Pick the largest face; equal areas go to the more confident detection.
pub fn select_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().max_by(|a, b| {
        a.area()
            .total_cmp(&b.area())
            .then(a.confidence.total_cmp(&b.confidence))
    })
}
