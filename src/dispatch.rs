//! Frame submission to the detection endpoint.
//!
//! `FrameDispatcher` is the seam between samplers and the backend. The HTTP
//! implementation is stateless apart from its client: encode, POST, parse.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::backend::{BackendClient, PROCESS_FRAME_PATH};
use crate::error::DispatchError;
use crate::frame::{SampledFrame, DEFAULT_JPEG_QUALITY};
use crate::registry::{Source, SourceId};

/// A single detection as returned by the backend. The shape is owned by the
/// backend; common keys are `name`, `status`, `confidence`, `bbox`.
pub type Detection = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub source_id: SourceId,
    pub captured_at: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ProcessFrameResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

pub trait FrameDispatcher: Send + Sync {
    fn submit(&self, frame: &SampledFrame) -> Result<DetectionResult, DispatchError>;
}

/// Receives every non-empty detection result produced by a sampler.
///
/// Called on the sampler's thread; implementations must not block for long.
pub trait DetectionObserver: Send + Sync {
    fn on_detections(&self, source: &Source, result: &DetectionResult);
}

pub struct HttpFrameDispatcher {
    client: BackendClient,
    jpeg_quality: u8,
}

impl HttpFrameDispatcher {
    pub fn new(client: BackendClient) -> Self {
        Self {
            client,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }
}

impl FrameDispatcher for HttpFrameDispatcher {
    fn submit(&self, frame: &SampledFrame) -> Result<DetectionResult, DispatchError> {
        let jpeg = frame
            .encode_jpeg(self.jpeg_quality)
            .map_err(|e| DispatchError::Encode(e.to_string()))?;
        let body = json!({
            "camera_id": frame.source_id,
            "frame": base64::engine::general_purpose::STANDARD.encode(&jpeg),
        });
        let response: ProcessFrameResponse = self.client.post_json(PROCESS_FRAME_PATH, &body)?;
        Ok(DetectionResult {
            source_id: frame.source_id,
            captured_at: frame.captured_at,
            detections: response.detections,
        })
    }
}
