//! Frame containers.
//!
//! - `RawFrame`: RGB8 pixels as produced by a capture device.
//! - `SampledFrame`: a raw frame selected by a sampler, stamped with its source
//!   and capture time. Produced, encoded, submitted, then dropped.
//!
//! Frame bytes are never logged; `Debug` prints dimensions only.

use std::fmt;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::FrameError;
use crate::registry::SourceId;

/// Default JPEG quality used when encoding frames for detection.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// RGB8 frame with validated dimensions.
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or(FrameError::Overflow { width, height })?;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
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

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// A frame that passed the sampling interval and is headed for detection.
#[derive(Debug)]
pub struct SampledFrame {
    pub source_id: SourceId,
    pub captured_at: DateTime<Utc>,
    frame: RawFrame,
}

impl SampledFrame {
    pub fn new(source_id: SourceId, frame: RawFrame) -> Self {
        Self {
            source_id,
            captured_at: Utc::now(),
            frame,
        }
    }

    /// A frame stamped with a capture time taken elsewhere.
    pub fn with_timestamp(source_id: SourceId, frame: RawFrame, captured_at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            captured_at,
            frame,
        }
    }

    /// Encode the frame as JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> image::ImageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.frame.byte_len() / 8);
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder.encode(
                self.frame.pixels(),
                self.frame.width,
                self.frame.height,
                ExtendedColorType::Rgb8,
            )?;
        }
        Ok(out)
    }
}
