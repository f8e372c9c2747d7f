//! V4L2 webcam device.
//!
//! `V4l2Device` captures from a local device node (e.g. /dev/video0) through libv4l
//! memory-mapped buffers. The negotiated pixel format decides how frames are normalized;
//! the driver may also pick a resolution other than the one requested.

use anyhow::{anyhow, Context, Result};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::CaptureDevice;
use crate::frame::{PixelFormat, RawFrame};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Device {
    path: String,
    width: u32,
    height: u32,
    state: Option<V4l2State>,
    frame_count: u64,
}

struct V4l2State {
    // Field order matters: the stream unmaps its buffers before the device closes.
    stream: MmapStream<'static>,
    _device: v4l::Device,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl V4l2Device {
    pub fn new(path: String, width: u32, height: u32) -> Self {
        Self {
            path,
            width,
            height,
            state: None,
            frame_count: 0,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn open_stream(path: &str, width: u32, height: u32) -> Result<V4l2State> {
        let device = v4l::Device::with_path(path)
            .with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Device: failed to set format on {}: {}",
                    path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = pixel_format(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{}: unsupported pixel format {}",
                path,
                String::from_utf8_lossy(&format.fourcc.repr)
            )
        })?;

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .context("create v4l2 buffer stream")?;

        log::info!(
            "V4l2Device: connected to {} ({}x{} {:?})",
            path,
            format.width,
            format.height,
            pixel_format
        );
        Ok(V4l2State {
            stream,
            _device: device,
            format: pixel_format,
            width: format.width,
            height: format.height,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn connect(&mut self) -> Result<()> {
        self.state = Some(Self::open_stream(&self.path, self.width, self.height)?);
        Ok(())
    }

    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        if self.state.is_some() {
            let path = &self.path;
            let previous = (self.width, self.height);
            renegotiate(&mut self.state, previous, (width, height), |w, h| {
                Self::open_stream(path, w, h)
            })?;
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, meta) = state.stream.next().context("capture v4l2 frame")?;
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let frame = RawFrame::new(buf[..used].to_vec(), state.width, state.height, state.format);
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Device: released {} after {} frames",
                self.path,
                self.frame_count
            );
        }
    }
}

/// Replace a mapped stream with one negotiated at `requested`.
///
/// The node only accepts a new format once the old buffers are unmapped, so the current
/// stream is dropped first. If the new format cannot be opened the stream is reopened at
/// `previous` and the error is still returned; a failed restore leaves `state` empty.
fn renegotiate<S>(
    state: &mut Option<S>,
    previous: (u32, u32),
    requested: (u32, u32),
    open: impl Fn(u32, u32) -> Result<S>,
) -> Result<()> {
    *state = None;
    match open(requested.0, requested.1) {
        Ok(stream) => {
            *state = Some(stream);
            Ok(())
        }
        Err(err) => {
            *state = Some(open(previous.0, previous.1).with_context(|| {
                format!("restore {}x{} after failed renegotiation", previous.0, previous.1)
            })?);
            Err(err.context(format!("renegotiate {}x{}", requested.0, requested.1)))
        }
    }
}

fn pixel_format(fourcc: &[u8; 4]) -> Option<PixelFormat> {
    match fourcc {
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"NV12" => Some(PixelFormat::Nv12),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"GREY" => Some(PixelFormat::Gray8),
        _ => None,
    }
}
