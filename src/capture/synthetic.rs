//! Synthetic capture for `stub://` URIs.
//!
//! Produces a moving RGB pattern paced at `fps` frames per second
//! (`stub://name?fps=30`, default 25). Used by tests and demos where no
//! camera is present.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::CaptureDevice;
use crate::frame::RawFrame;

const DEFAULT_FPS: u32 = 25;

pub struct SyntheticCapture {
    label: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    frame_count: u64,
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticCapture {
    pub fn open(uri: &str, width: u32, height: u32) -> Result<Self> {
        let url = Url::parse(uri).context("parse synthetic uri")?;
        if url.scheme() != "stub" {
            return Err(anyhow!("synthetic capture expects stub://, got {}", uri));
        }
        let fps = match url.query_pairs().find(|(key, _)| key == "fps") {
            Some((_, value)) => value
                .parse::<u32>()
                .with_context(|| format!("invalid fps '{}' in {}", value, uri))?,
            None => DEFAULT_FPS,
        };
        if fps == 0 {
            return Err(anyhow!("fps must be greater than zero in {}", uri));
        }
        log::info!("capture: opened {} (synthetic, {} fps)", uri, fps);
        Ok(Self {
            label: uri.to_string(),
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;

        // Shift the scene every 50 frames to simulate entry/exit.
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CaptureDevice for SyntheticCapture {
    fn read_frame(&mut self) -> Result<RawFrame> {
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
        self.frame_count += 1;

        let pixels = self.generate_pixels();
        Ok(RawFrame::from_rgb(pixels, self.width, self.height)?)
    }

    fn release(&mut self) {
        log::debug!(
            "capture: released {} after {} frames",
            self.label,
            self.frame_count
        );
    }
}
