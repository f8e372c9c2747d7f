//! Scripted device: replays a fixed list of frames, then reports end of stream.
//!
//! Used to drive the acquisition loop deterministically. A `ReadGate` lets a test hold
//! each read until it is explicitly allowed, and observe when the loop enters the next
//! read (which means the previous iteration, including delivery, has finished).

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use super::CaptureDevice;
use crate::frame::RawFrame;

/// Pause between end-of-stream reads, standing in for a device blocking on no data.
const EXHAUSTED_READ_DELAY: Duration = Duration::from_millis(1);

/// One scripted read result.
pub enum ScriptedRead {
    Frame(RawFrame),
    Failure(String),
}

pub struct ScriptedDevice {
    name: String,
    script: VecDeque<ScriptedRead>,
    available: bool,
    configured: Option<(u32, u32)>,
    releases: Arc<AtomicUsize>,
    gate: Option<GateSide>,
}

struct GateSide {
    entered: Sender<()>,
    permits: Receiver<()>,
}

/// Test-side handle for a gated `ScriptedDevice`.
pub struct ReadGate {
    entered: Receiver<()>,
    permits: Option<Sender<()>>,
}

impl ReadGate {
    /// Wait until the device is inside its next `read` call.
    pub fn wait_for_read(&self, timeout: Duration) -> bool {
        match self.entered.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Let one pending (or future) read complete.
    pub fn allow_read(&self) {
        if let Some(permits) = &self.permits {
            let _ = permits.send(());
        }
    }

    /// Stop gating: all further reads complete immediately.
    pub fn open(&mut self) {
        self.permits = None;
    }
}

impl ScriptedDevice {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self::with_script(frames.into_iter().map(ScriptedRead::Frame).collect())
    }

    pub fn with_script(script: Vec<ScriptedRead>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: script.into(),
            available: true,
            configured: None,
            releases: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    /// A device whose `connect` always fails.
    pub fn unavailable() -> Self {
        let mut device = Self::new(Vec::new());
        device.available = false;
        device
    }

    /// Gate every read on a permit from the returned `ReadGate`.
    pub fn gated(mut self) -> (Self, ReadGate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (permit_tx, permit_rx) = mpsc::channel();
        self.gate = Some(GateSide {
            entered: entered_tx,
            permits: permit_rx,
        });
        (
            self,
            ReadGate {
                entered: entered_rx,
                permits: Some(permit_tx),
            },
        )
    }

    /// Shared counter of `release` calls, readable after the device is moved away.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        self.releases.clone()
    }

    pub fn configured(&self) -> Option<(u32, u32)> {
        self.configured
    }

    fn wait_for_permit(&self) {
        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            // A dropped gate handle lets reads through.
            let _ = gate.permits.recv();
        }
    }
}

impl CaptureDevice for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<()> {
        if !self.available {
            return Err(anyhow!("{}: device unavailable", self.name));
        }
        Ok(())
    }

    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        self.configured = Some((width, height));
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        self.wait_for_permit();
        match self.script.pop_front() {
            Some(ScriptedRead::Frame(frame)) => Ok(Some(frame)),
            Some(ScriptedRead::Failure(reason)) => Err(anyhow!(reason)),
            None => {
                std::thread::sleep(EXHAUSTED_READ_DELAY);
                Ok(None)
            }
        }
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn gray(value: u8) -> RawFrame {
        RawFrame::new(vec![value; 4], 2, 2, PixelFormat::Gray8)
    }

    #[test]
    fn replays_script_then_reports_end_of_stream() -> Result<()> {
        let mut device = ScriptedDevice::with_script(vec![
            ScriptedRead::Frame(gray(1)),
            ScriptedRead::Failure("glitch".to_string()),
            ScriptedRead::Frame(gray(2)),
        ]);
        device.connect()?;

        assert_eq!(device.read()?, Some(gray(1)));
        assert!(device.read().is_err());
        assert_eq!(device.read()?, Some(gray(2)));
        assert_eq!(device.read()?, None);
        Ok(())
    }

    #[test]
    fn counts_releases() {
        let mut device = ScriptedDevice::new(Vec::new());
        let releases = device.release_counter();
        device.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn records_requested_resolution() -> Result<()> {
        let mut device = ScriptedDevice::new(Vec::new());
        assert_eq!(device.configured(), None);
        device.configure(320, 240)?;
        assert_eq!(device.configured(), Some((320, 240)));
        Ok(())
    }

    #[test]
    fn unavailable_device_fails_to_connect() {
        assert!(ScriptedDevice::unavailable().connect().is_err());
    }

    #[test]
    fn dropped_gate_lets_reads_through() -> Result<()> {
        let (mut device, gate) = ScriptedDevice::new(vec![gray(3)]).gated();
        drop(gate);
        assert_eq!(device.read()?, Some(gray(3)));
        Ok(())
    }
}
