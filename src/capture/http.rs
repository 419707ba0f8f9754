//! HTTP capture for MJPEG streams and JPEG snapshot endpoints.
//!
//! A `multipart/*` response is consumed as an MJPEG stream; anything else is
//! treated as a snapshot URL fetched once per read.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::CaptureDevice;
use crate::frame::RawFrame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpCapture {
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader<Box<dyn Read + Send + Sync>>),
    Snapshot,
    Released,
}

impl HttpCapture {
    pub fn open(url: &str, read_timeout: Duration) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(read_timeout)
            .timeout_read(read_timeout)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegReader::new(response.into_reader(), MAX_JPEG_BYTES))
        } else {
            HttpStream::Snapshot
        };
        log::info!("capture: opened {} ({})", url, content_type);
        Ok(Self {
            url: url.to_string(),
            agent,
            stream,
            frame_count: 0,
        })
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl CaptureDevice for HttpCapture {
    fn read_frame(&mut self) -> Result<RawFrame> {
        let jpeg = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.next_frame()?,
            HttpStream::Snapshot => self.fetch_snapshot()?,
            HttpStream::Released => return Err(anyhow!("http capture already released")),
        };
        let frame = decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.stream = HttpStream::Released;
        log::debug!(
            "capture: released {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

/// Splits a multipart MJPEG body into JPEG frames on SOI/EOI markers.
///
/// Part headers between frames are discarded. A frame that grows past
/// `max_frame` bytes fails the read and is dropped; the next read resyncs on
/// the following SOI.
struct MjpegReader<R> {
    reader: R,
    pending: Vec<u8>,
    max_frame: usize,
}

impl<R: Read> MjpegReader<R> {
    fn new(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(64 * 1024),
            max_frame,
        }
    }

    fn next_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.pending) {
                return Ok(self.pending.drain(..end).skip(start).collect());
            }
            self.discard_preamble();
            if self.pending.len() > self.max_frame {
                self.pending.clear();
                return Err(anyhow!("mjpeg frame exceeds {} bytes", self.max_frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }

    /// Drop everything before the first SOI. With no SOI yet, keep a trailing
    /// 0xFF since it may be the first half of one.
    fn discard_preamble(&mut self) {
        match self.pending.windows(2).position(|w| w == [0xFF, 0xD8]) {
            Some(start) => {
                self.pending.drain(..start);
            }
            None => {
                let keep = usize::from(self.pending.last() == Some(&0xFF));
                let drop = self.pending.len() - keep;
                self.pending.drain(..drop);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RawFrame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(RawFrame::from_rgb(rgb.into_raw(), width, height)?)
}

/// Locate the first complete JPEG (SOI..EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
