//! Frame type and image decoding for uploaded face images.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;

const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid image: {0}")]
    Invalid(String),
    #[error("image has zero width or height")]
    Empty,
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A decoded RGB frame (packed, 3 bytes per pixel, row-major).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    /// Decode an uploaded image (any format the `image` crate understands).
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Invalid("empty upload".into()));
        }
        let decoded =
            image::load_from_memory(bytes).map_err(|e| FrameError::Invalid(e.to_string()))?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        tracing::debug!(width, height, "decoded upload");
        Ok(Self {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    /// Wrap raw packed RGB bytes, checking the length against the dimensions.
    pub fn from_raw(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// RGB value at (x, y). Caller guarantees the coordinate is in bounds.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let off = (y * self.width as usize + x) * 3;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    /// Re-encode the frame as JPEG.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).write_image(
            &self.data,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(buf)
    }
}
