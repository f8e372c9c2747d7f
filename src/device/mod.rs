//! Capture devices.
//!
//! This module provides the device side of the frame pipeline:
//! - `CaptureDevice`: the trait a frame source drives (connect, configure, read, release)
//! - Synthetic `stub://` devices (testing, demos)
//! - Scripted devices that replay a fixed list of frames (testing)
//! - USB/V4L2 webcams (feature: capture-v4l2)
//!
//! Devices produce `RawFrame` instances in their native pixel format. Normalization into
//! a `Frame` and resizing to the target resolution happen in the acquisition loop.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

use crate::frame::RawFrame;

pub(crate) mod normalize;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use scripted::{ReadGate, ScriptedDevice};
pub use synthetic::SyntheticDevice;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Device;

/// A frame-producing device.
///
/// After `connect` succeeds the device is owned by exactly one acquisition loop, which is
/// the only caller of `read` and `release`.
pub trait CaptureDevice: Send {
    /// Human-readable identifier for logs.
    fn name(&self) -> &str;

    /// Open the device. Failure here means the device is unavailable.
    fn connect(&mut self) -> Result<()>;

    /// Request an output resolution. Best-effort: a device may keep delivering another
    /// size, which the acquisition loop resizes.
    fn configure(&mut self, width: u32, height: u32) -> Result<()>;

    /// Read one frame. `Ok(None)` means no frame was available (including end of
    /// stream); `Err` is a transient read failure.
    fn read(&mut self) -> Result<Option<RawFrame>>;

    /// Release the device handle.
    fn release(&mut self);
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        (**self).configure(width, height)
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Parsed device identifier.
///
/// - `0`, `1`, ... : V4L2 device index (`/dev/videoN`)
/// - `/dev/...`    : V4L2 device node
/// - `stub://kind` : synthetic device (see `SyntheticDevice`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceId {
    Index(u32),
    Path(String),
    Stub(String),
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("device identifier is empty"));
        }
        if let Some(kind) = value.strip_prefix("stub://") {
            return Ok(DeviceId::Stub(kind.to_string()));
        }
        if value.starts_with('/') {
            return Ok(DeviceId::Path(value.to_string()));
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            let index = value
                .parse()
                .map_err(|_| anyhow!("device index out of range: {}", value))?;
            return Ok(DeviceId::Index(index));
        }
        Err(anyhow!("unsupported device identifier: {}", value))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(index) => write!(f, "{}", index),
            DeviceId::Path(path) => f.write_str(path),
            DeviceId::Stub(kind) => write!(f, "stub://{}", kind),
        }
    }
}

/// Construct (but do not connect) the device named by `id`.
pub fn device_for(id: &DeviceId, width: u32, height: u32) -> Result<Box<dyn CaptureDevice>> {
    match id {
        DeviceId::Stub(kind) => Ok(Box::new(SyntheticDevice::new(kind, width, height)?)),
        DeviceId::Index(index) => v4l2_device(format!("/dev/video{}", index), width, height),
        DeviceId::Path(path) => v4l2_device(path.clone(), width, height),
    }
}

#[cfg(feature = "capture-v4l2")]
fn v4l2_device(path: String, width: u32, height: u32) -> Result<Box<dyn CaptureDevice>> {
    Ok(Box::new(V4l2Device::new(path, width, height)))
}

#[cfg(not(feature = "capture-v4l2"))]
fn v4l2_device(path: String, _width: u32, _height: u32) -> Result<Box<dyn CaptureDevice>> {
    Err(anyhow!(
        "{} requires the capture-v4l2 feature",
        path
    ))
}
