//! Capture handles for feed sources.
//!
//! The URI scheme picks the capture method:
//! - `stub://` synthetic feed (tests, demos)
//! - `http(s)://` MJPEG stream or JPEG snapshot endpoint
//! - `rtsp(s)://` IP camera stream (feature: capture-gstreamer)
//! - anything else falls back to the local default device (feature: capture-v4l2)
//!
//! Every read is bounded by a timeout so that sampler loops can observe
//! cancellation. Frames are handed to the sampler and never stored.

mod http;
#[cfg(feature = "capture-v4l2")]
mod local;
#[cfg(feature = "capture-gstreamer")]
mod rtsp;
pub mod synthetic;

use std::time::Duration;

use anyhow::Result;
use url::Url;

use crate::frame::RawFrame;
use crate::registry::Source;

pub use http::HttpCapture;
pub use synthetic::SyntheticCapture;

pub const DEFAULT_LOCAL_DEVICE: &str = "/dev/video0";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// An open capture handle.
pub trait CaptureDevice: Send {
    /// Read the next frame. Must return within a bounded time.
    fn read_frame(&mut self) -> Result<RawFrame>;

    /// Release the underlying device or connection.
    fn release(&mut self) {}
}

/// Opens capture handles for sources.
pub trait CaptureOpener: Send + Sync {
    fn open(&self, source: &Source) -> Result<Box<dyn CaptureDevice>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureKind {
    Synthetic,
    Http,
    Rtsp,
    Local,
}

impl CaptureKind {
    pub fn for_uri(uri: &str) -> Self {
        let Ok(url) = Url::parse(uri) else {
            return CaptureKind::Local;
        };
        match url.scheme() {
            "stub" => CaptureKind::Synthetic,
            "http" | "https" => CaptureKind::Http,
            "rtsp" | "rtsps" => CaptureKind::Rtsp,
            _ => CaptureKind::Local,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Device opened when a source URI has no recognized streaming scheme.
    pub local_device: String,
    /// Upper bound on a single frame read.
    pub read_timeout: Duration,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            local_device: DEFAULT_LOCAL_DEVICE.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            width: 640,
            height: 480,
        }
    }
}

/// Opener that dispatches on the URI scheme.
#[derive(Clone, Debug, Default)]
pub struct DefaultOpener {
    config: CaptureConfig,
}

impl DefaultOpener {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl CaptureOpener for DefaultOpener {
    fn open(&self, source: &Source) -> Result<Box<dyn CaptureDevice>> {
        match CaptureKind::for_uri(&source.url) {
            CaptureKind::Synthetic => Ok(Box::new(SyntheticCapture::open(
                &source.url,
                self.config.width,
                self.config.height,
            )?)),
            CaptureKind::Http => Ok(Box::new(HttpCapture::open(
                &source.url,
                self.config.read_timeout,
            )?)),
            CaptureKind::Rtsp => open_rtsp(&source.url, &self.config),
            CaptureKind::Local => {
                log::info!(
                    "capture: source {} uri has no streaming scheme, using local device {}",
                    source.id,
                    self.config.local_device
                );
                open_local(&self.config)
            }
        }
    }
}

#[cfg(feature = "capture-gstreamer")]
fn open_rtsp(url: &str, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(rtsp::RtspCapture::open(url, config.read_timeout)?))
}

#[cfg(not(feature = "capture-gstreamer"))]
fn open_rtsp(_url: &str, _config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    anyhow::bail!("RTSP capture requires the capture-gstreamer feature")
}

#[cfg(feature = "capture-v4l2")]
fn open_local(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(local::LocalCapture::open(
        &config.local_device,
        config.width,
        config.height,
        config.read_timeout,
    )?))
}

#[cfg(not(feature = "capture-v4l2"))]
fn open_local(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
    anyhow::bail!(
        "local capture of {} requires the capture-v4l2 feature",
        config.local_device
    )
}
