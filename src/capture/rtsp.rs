//! RTSP capture via GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` delivering RGB.
//! The appsink keeps one buffer and drops older ones so that a slow sampler
//! always sees a recent frame.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::CaptureDevice;
use crate::frame::RawFrame;

pub struct RtspCapture {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    frame_count: u64,
}

impl RtspCapture {
    pub fn open(url: &str, read_timeout: Duration) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start RTSP pipeline for {}", url))?;
        log::info!("capture: opened {} (gstreamer)", url);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            read_timeout,
            frame_count: 0,
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("RTSP stream reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl CaptureDevice for RtspCapture {
    fn read_frame(&mut self) -> Result<RawFrame> {
        self.check_bus()?;
        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;
        let frame = sample_to_frame(&sample)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("capture: failed to stop pipeline for {}: {}", self.url, err);
        }
        log::debug!(
            "capture: released {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<RawFrame> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Ok(RawFrame::from_rgb(pixels, width, height)?);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok(RawFrame::from_rgb(pixels, width, height)?)
}
