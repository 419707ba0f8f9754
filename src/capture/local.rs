//! Local capture device via V4L2.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::CaptureDevice;
use crate::frame::RawFrame;

pub struct LocalCapture {
    device_path: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl LocalCapture {
    /// Reads that wait longer than `read_timeout` for a buffer fail with a
    /// timed-out I/O error.
    pub fn open(device_path: &str, width: u32, height: u32, read_timeout: Duration) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("capture: failed to set format on {}: {}", device_path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "v4l2 device {} does not deliver RGB3 (got {})",
                device_path,
                format.fourcc
            ));
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))?;
                stream.set_timeout(read_timeout);
                Ok::<_, anyhow::Error>(stream)
            },
        }
        .try_build()?;

        log::info!(
            "capture: opened {} ({}x{})",
            device_path,
            format.width,
            format.height
        );
        Ok(Self {
            device_path: device_path.to_string(),
            state: Some(state),
            width: format.width,
            height: format.height,
            frame_count: 0,
        })
    }
}

impl CaptureDevice for LocalCapture {
    fn read_frame(&mut self) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device released")?;
        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 frame")?;

        let expected = (self.width as usize) * (self.height as usize) * 3;
        let pixels = buf
            .get(..expected)
            .context("v4l2 buffer shorter than frame")?
            .to_vec();
        self.frame_count += 1;
        Ok(RawFrame::from_rgb(pixels, self.width, self.height)?)
    }

    fn release(&mut self) {
        self.state = None;
        log::debug!(
            "capture: released {} after {} frames",
            self.device_path,
            self.frame_count
        );
    }
}
