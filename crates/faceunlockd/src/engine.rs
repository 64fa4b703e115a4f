use faceunlock_core::frame::FrameError;
use faceunlock_core::pipeline::PipelineError;
use faceunlock_core::{CosineMatcher, Embedding, FacePipeline, MatchResult, Matcher, Reference, RgbFrame};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    InvalidImage(#[source] FrameError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("could not re-encode reference photo: {0}")]
    Encode(#[source] FrameError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine request timed out")]
    Timeout,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment request.
pub struct EnrollResult {
    pub embedding: Embedding,
    /// The uploaded photo, re-encoded as JPEG for the reference archive.
    pub jpeg: Vec<u8>,
    /// Detector confidence of the enrolled face.
    pub quality: f32,
}

/// Result of an unlock attempt that got past image decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    NoFace,
    Compared(MatchResult),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Enroll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Verify {
        image: Vec<u8>,
        gallery: Vec<Reference>,
        threshold: f32,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Decode the upload, find its face and compute the embedding to enroll.
    pub async fn enroll(&self, image: Vec<u8>) -> Result<EnrollResult, EngineError> {
        self.request(|reply| EngineRequest::Enroll { image, reply })
            .await
    }

    /// Decode the upload, find its face and compare it against `gallery`.
    pub async fn verify(
        &self,
        image: Vec<u8>,
        gallery: Vec<Reference>,
        threshold: f32,
    ) -> Result<VerifyOutcome, EngineError> {
        self.request(|reply| EngineRequest::Verify {
            image,
            gallery,
            threshold,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread that owns `pipeline`.
///
/// Requests are served one at a time in arrival order; ONNX sessions stay on
/// this thread.
pub fn spawn_engine(
    mut pipeline: Box<dyn FacePipeline>,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("faceunlock-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { image, reply } => {
                        let result = run_enroll(pipeline.as_mut(), &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify {
                        image,
                        gallery,
                        threshold,
                        reply,
                    } => {
                        let result = run_verify(pipeline.as_mut(), &image, &gallery, threshold);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

fn run_enroll(pipeline: &mut dyn FacePipeline, image: &[u8]) -> Result<EnrollResult, EngineError> {
    let frame = RgbFrame::decode(image).map_err(EngineError::InvalidImage)?;
    let capture = pipeline.embed(&frame)?.ok_or(EngineError::NoFaceDetected)?;
    let jpeg = frame.to_jpeg().map_err(EngineError::Encode)?;

    tracing::info!(
        confidence = capture.face.confidence,
        width = frame.width,
        height = frame.height,
        "enroll: face embedded"
    );

    Ok(EnrollResult {
        embedding: capture.embedding,
        jpeg,
        quality: capture.face.confidence,
    })
}

fn run_verify(
    pipeline: &mut dyn FacePipeline,
    image: &[u8],
    gallery: &[Reference],
    threshold: f32,
) -> Result<VerifyOutcome, EngineError> {
    let frame = RgbFrame::decode(image).map_err(EngineError::InvalidImage)?;
    let Some(capture) = pipeline.embed(&frame)? else {
        tracing::debug!("verify: no face in upload");
        return Ok(VerifyOutcome::NoFace);
    };

    let result = CosineMatcher.compare(&capture.embedding, gallery, threshold);
    tracing::debug!(
        gallery = gallery.len(),
        similarity = result.similarity,
        matched = result.matched,
        "verify: compared"
    );
    Ok(VerifyOutcome::Compared(result))
}

/// Deterministic pipeline stand-in for tests: the embedding is the colour of
/// the top-left pixel, and a black pixel means "no face".
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use faceunlock_core::{BoundingBox, FaceCapture};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    pub struct ColourPipeline;

    impl FacePipeline for ColourPipeline {
        fn embed(&mut self, frame: &RgbFrame) -> Result<Option<FaceCapture>, PipelineError> {
            let [r, g, b] = frame.pixel(0, 0);
            if [r, g, b] == [0, 0, 0] {
                return Ok(None);
            }
            let embedding = Embedding {
                values: vec![r as f32, g as f32, b as f32],
                model_version: Some("colour".into()),
            }
            .normalized();
            Ok(Some(FaceCapture {
                embedding,
                face: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: frame.width as f32,
                    height: frame.height as f32,
                    confidence: 0.9,
                    landmarks: None,
                },
            }))
        }
    }

    /// `ColourPipeline` that takes `.0` to answer.
    pub struct SlowPipeline(pub Duration);

    impl FacePipeline for SlowPipeline {
        fn embed(&mut self, frame: &RgbFrame) -> Result<Option<FaceCapture>, PipelineError> {
            std::thread::sleep(self.0);
            ColourPipeline.embed(frame)
        }
    }

    /// Takes the engine thread down on its first request.
    pub struct PanickingPipeline;

    impl FacePipeline for PanickingPipeline {
        fn embed(&mut self, _frame: &RgbFrame) -> Result<Option<FaceCapture>, PipelineError> {
            panic!("pipeline crashed");
        }
    }

    /// A small PNG filled with one colour.
    pub fn png(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb(rgb));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    pub fn engine() -> EngineHandle {
        spawn_engine(Box::new(ColourPipeline), Duration::from_secs(5)).unwrap()
    }
}
