//! Decoded video frames

use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

use crate::{PipelineError, Result};

/// One decoded image pulled from a frame source.
///
/// Pixel data is shared through an `Arc`, so cloning a frame to hand it to
/// both the return path and the inference engine never copies pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the producing source
    pub seq: u64,

    /// Wall-clock time the frame was decoded
    pub captured_at: SystemTime,

    /// RGB pixels
    pub image: Arc<RgbImage>,
}

impl Frame {
    /// Create a new frame stamped with the current time
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self { seq, captured_at: SystemTime::now(), image: Arc::new(image) }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode the frame as JPEG at the given quality (1-100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if self.width() == 0 || self.height() == 0 {
            return Err(PipelineError::Encode {
                details: format!("frame {} has no pixels", self.seq),
            });
        }

        let mut buffer = Cursor::new(Vec::with_capacity(self.image.len() / 8));
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
        encoder.encode_image(self.image.as_ref())?;
        Ok(buffer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let frame = Frame::new(7, RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10])));
        let jpeg = frame.encode_jpeg(75).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!((frame.width(), frame.height()), (16, 8));
    }

    #[test]
    fn empty_frames_are_rejected() {
        let frame = Frame::new(1, RgbImage::new(0, 0));
        assert!(matches!(frame.encode_jpeg(75), Err(PipelineError::Encode { .. })));
    }

    #[test]
    fn clones_share_pixels() {
        let frame = Frame::new(1, RgbImage::new(4, 4));
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.image, &copy.image));
    }
}
