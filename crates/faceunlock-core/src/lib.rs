//! faceunlock-core — Face detection and recognition engine.
//!
//! Decodes uploaded images, finds faces with SCRFD, aligns them and
//! computes ArcFace embeddings, all via ONNX Runtime on the CPU.

pub mod alignment;
pub mod detector;
pub mod frame;
pub mod pipeline;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use frame::RgbFrame;
pub use pipeline::{FaceCapture, FacePipeline, OnnxPipeline};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, MatchResult, Matcher, Reference};

/// SCRFD detection model file name.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default data directory: `$XDG_DATA_HOME/faceunlock`, falling back to
/// `~/.local/share/faceunlock`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceunlock")
}

/// Default directory holding the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
