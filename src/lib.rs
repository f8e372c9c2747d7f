//! vision-capture
//!
//! Threaded frame acquisition for vision demos: a `FrameSource` reads frames from a
//! capture device on its own thread and hands each one to a single sink, with
//! pause/resume and a bounded, cooperative shutdown.
//!
//! # Pipeline
//!
//! ```text
//! CaptureDevice --RawFrame--> acquisition loop --Frame--> sink (on_frame)
//!                             normalize + resize
//! ```
//!
//! - Frames are delivered in acquisition order, one at a time. A slow sink throttles
//!   capture; nothing is buffered or dropped on its behalf.
//! - Frames read while paused are discarded, never delivered.
//! - The device is released exactly once, on the acquisition thread, when the loop exits.
//!
//! # Module Structure
//!
//! - `frame`: `RawFrame` (device output) and `Frame` (normalized snapshot)
//! - `device`: the `CaptureDevice` trait and its backends (synthetic, scripted, V4L2)
//! - `source`: `FrameSource`, the session state machine and acquisition loop
//! - `sink`: ready-made sinks (recorder, counter, PNG snapshot)
//! - `config`: settings for the `capture` binary

pub mod config;
pub mod device;
pub mod frame;
pub mod sink;
pub mod source;

pub use config::CaptureConfig;
pub use device::{CaptureDevice, DeviceId, ScriptedDevice, SyntheticDevice};
#[cfg(feature = "capture-v4l2")]
pub use device::V4l2Device;
pub use frame::{ChannelLayout, Frame, PixelFormat, RawFrame};
pub use sink::{FrameCallback, FrameCounter, FrameRecorder, SnapshotSink};
pub use source::{
    FrameSource, OpenError, PauseControl, SessionState, SourceConfig, SourceError, SourceStats,
    StopOutcome, DEFAULT_STOP_GRACE,
};
