//! Frame source: threaded acquisition loop with pause/resume and bounded shutdown.
//!
//! A `FrameSource` owns one capture session. `start()` moves the device onto a dedicated
//! acquisition thread which reads frames at the device's native rate and hands each one
//! to the registered sink, synchronously, in acquisition order.
//!
//! Lifecycle:
//!
//! ```text
//! Closed -> Open(Idle) -> Open(Running) -> Open(Stopping) -> Closed
//! ```
//!
//! `open` is the only way into `Open(Idle)`. Pausing is a flag inside `Running`: the loop
//! keeps reading (so the device stays warm) and drops every frame read while paused.
//!
//! Shutdown is cooperative. `stop()` raises a termination flag checked once per
//! iteration and waits at most `stop_grace` for the loop to exit. A device read that
//! blocks longer than that cannot be interrupted; `stop()` then reports
//! `StopOutcome::TimedOut` and the loop releases the device whenever the read returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::device::{self, CaptureDevice, DeviceId};
use crate::frame::Frame;
use crate::sink::FrameCallback;

/// Default wait applied by `stop()`.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(100);

/// Errors returned by `FrameSource::open`.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("invalid target resolution {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },
}

/// Errors returned by control calls on an opened source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("capture session is closed")]
    Closed,
    #[error("capture session is stopping")]
    Stopping,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result of `stop()`. A timeout is a documented limitation, not a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop exited and the device was released.
    Stopped,
    /// The loop did not exit within the grace period; it still owns the device.
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Idle,
    Running,
    Stopping,
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Device identifier (see `DeviceId`).
    pub device: String,
    /// Target frame width. Delivered frames are resized to it.
    pub width: u32,
    /// Target frame height. Delivered frames are resized to it.
    pub height: u32,
    /// Upper bound on how long `stop()` blocks.
    pub stop_grace: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            width: 640,
            height: 480,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Counters for a frame source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Frames successfully read from the device.
    pub frames_read: u64,
    /// Frames handed to the sink.
    pub frames_delivered: u64,
    /// Frames read while paused and dropped.
    pub frames_discarded: u64,
    /// Failed reads (including frames that could not be normalized).
    pub read_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_read: AtomicU64,
    frames_delivered: AtomicU64,
    frames_discarded: AtomicU64,
    read_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable pause switch for a running source, usable from any thread.
#[derive(Clone, Debug, Default)]
pub struct PauseControl {
    paused: Arc<AtomicBool>,
}

impl PauseControl {
    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Flip the pause flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

type SharedSink = Arc<Mutex<Option<FrameCallback>>>;

struct Worker {
    join: JoinHandle<()>,
    exited: Receiver<()>,
}

/// Threaded frame source over one capture device.
pub struct FrameSource {
    config: SourceConfig,
    device: Option<Box<dyn CaptureDevice>>,
    worker: Option<Worker>,
    sink: SharedSink,
    pause: PauseControl,
    terminate: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl FrameSource {
    /// Open `device` and request `width` x `height` output.
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self, OpenError> {
        Self::open_config(SourceConfig {
            device: device.to_string(),
            width,
            height,
            ..SourceConfig::default()
        })
    }

    /// Open the device named in `config`.
    pub fn open_config(config: SourceConfig) -> Result<Self, OpenError> {
        check_resolution(config.width, config.height)?;
        let id: DeviceId = config.device.parse().map_err(|err| unavailable(&config.device, err))?;
        let backend = device::device_for(&id, config.width, config.height)
            .map_err(|err| unavailable(&config.device, err))?;
        Self::connect(backend, config)
    }

    /// Open an already-constructed device. `config.device` is only used for reporting.
    pub fn open_with<D>(device: D, config: SourceConfig) -> Result<Self, OpenError>
    where
        D: CaptureDevice + 'static,
    {
        check_resolution(config.width, config.height)?;
        Self::connect(device, config)
    }

    fn connect<D>(mut device: D, config: SourceConfig) -> Result<Self, OpenError>
    where
        D: CaptureDevice + 'static,
    {
        device
            .connect()
            .map_err(|err| unavailable(&config.device, err))?;
        if let Err(err) = device.configure(config.width, config.height) {
            log::warn!(
                "FrameSource: failed to configure {} to {}x{}: {}",
                device.name(),
                config.width,
                config.height,
                err
            );
        }
        log::info!(
            "FrameSource: opened {} (target {}x{})",
            device.name(),
            config.width,
            config.height
        );

        Ok(Self {
            config,
            device: Some(Box::new(device)),
            worker: None,
            sink: Arc::new(Mutex::new(None)),
            pause: PauseControl::default(),
            terminate: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Register the sink. Replaces any earlier registration; may be called while running.
    ///
    /// The callback runs on the acquisition thread and blocks the next read until it
    /// returns.
    pub fn on_frame<F>(&self, callback: F)
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *sink = Some(Box::new(callback));
    }

    /// Start the acquisition loop. No-op when already running.
    pub fn start(&mut self) -> Result<(), SourceError> {
        match self.state() {
            SessionState::Running => return Ok(()),
            SessionState::Stopping => return Err(SourceError::Stopping),
            SessionState::Closed => return Err(SourceError::Closed),
            SessionState::Idle => {}
        }
        let device = self.device.take().ok_or(SourceError::Closed)?;
        let name = device.name().to_string();
        let (exit_tx, exit_rx) = mpsc::channel();
        let guard = DeviceGuard {
            device,
            exited: exit_tx,
        };
        let acquisition = Acquisition {
            sink: self.sink.clone(),
            paused: self.pause.paused.clone(),
            terminate: self.terminate.clone(),
            counters: self.counters.clone(),
            width: self.config.width,
            height: self.config.height,
        };

        // On spawn failure the closure (and the guard inside it) is dropped, which
        // releases the device and leaves the session closed.
        let join = std::thread::Builder::new()
            .name(format!("capture:{}", name))
            .spawn(move || acquisition.run(guard))?;

        log::info!("FrameSource: acquisition started on {}", name);
        self.worker = Some(Worker {
            join,
            exited: exit_rx,
        });
        Ok(())
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Flip the pause flag and return the new value.
    pub fn toggle_pause(&self) -> bool {
        self.pause.toggle()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Handle for pausing from another thread (e.g. an input handler).
    pub fn pause_control(&self) -> PauseControl {
        self.pause.clone()
    }

    /// Request termination and wait up to `stop_grace` for the loop to exit.
    ///
    /// Calling `stop()` again after `TimedOut` waits another grace period.
    pub fn stop(&mut self) -> StopOutcome {
        if let Some(mut device) = self.device.take() {
            // Never started: release directly.
            device.release();
            log::info!("FrameSource: closed {} (never started)", device.name());
            return StopOutcome::Stopped;
        }
        let Some(worker) = self.worker.take() else {
            return StopOutcome::Stopped;
        };

        self.terminate.store(true, Ordering::Release);
        match worker.exited.recv_timeout(self.config.stop_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    log::error!("FrameSource: acquisition thread panicked");
                }
                log::info!("FrameSource: stopped {}", self.config.device);
                StopOutcome::Stopped
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "FrameSource: {} did not stop within {:?}; device is released when the pending read returns",
                    self.config.device,
                    self.config.stop_grace
                );
                self.worker = Some(worker);
                StopOutcome::TimedOut
            }
        }
    }

    /// Session state. A loop that has exited on its own (sink panic, or a timed-out
    /// stop whose read later returned) has already released the device and reports
    /// `Closed`.
    pub fn state(&self) -> SessionState {
        match (&self.device, &self.worker) {
            (Some(_), _) => SessionState::Idle,
            (None, Some(worker)) if worker.join.is_finished() => SessionState::Closed,
            (None, Some(_)) if self.terminate.load(Ordering::Acquire) => SessionState::Stopping,
            (None, Some(_)) => SessionState::Running,
            (None, None) => SessionState::Closed,
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        // A timed-out worker is detached; it still releases the device on exit.
        let _ = self.stop();
    }
}

fn check_resolution(width: u32, height: u32) -> Result<(), OpenError> {
    if width == 0 || height == 0 {
        return Err(OpenError::InvalidResolution { width, height });
    }
    Ok(())
}

fn unavailable(device: &str, err: anyhow::Error) -> OpenError {
    OpenError::DeviceUnavailable {
        device: device.to_string(),
        reason: format!("{:#}", err),
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

/// Owns the device on the acquisition thread. Dropping it releases the device exactly
/// once and signals `stop()`, on normal exit and on unwind alike.
struct DeviceGuard {
    device: Box<dyn CaptureDevice>,
    exited: Sender<()>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.device.release();
        let _ = self.exited.send(());
    }
}

struct Acquisition {
    sink: SharedSink,
    paused: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    counters: Arc<Counters>,
    width: u32,
    height: u32,
}

impl Acquisition {
    fn run(self, mut guard: DeviceGuard) {
        let mut sequence = 0u64;
        while !self.terminate.load(Ordering::Acquire) {
            let read = guard.device.read();

            let raw = match read {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::debug!("FrameSource: read failed on {}: {:#}", guard.device.name(), err);
                    continue;
                }
            };
            self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
            sequence += 1;

            if self.paused.load(Ordering::Acquire) {
                self.counters.frames_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let frame = match raw
                .into_frame()
                .and_then(|frame| frame.resized(self.width, self.height))
            {
                Ok(frame) => frame.with_sequence(sequence),
                Err(err) => {
                    self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "FrameSource: dropped malformed frame from {}: {:#}",
                        guard.device.name(),
                        err
                    );
                    continue;
                }
            };
            self.deliver(frame);
        }
        log::debug!("FrameSource: acquisition loop exiting");
    }

    fn deliver(&self, frame: Frame) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = sink.as_mut() {
            callback(frame);
            self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ReadGate, ScriptedDevice};
    use crate::frame::{PixelFormat, RawFrame};
    use crate::sink::FrameRecorder;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn gray(value: u8) -> RawFrame {
        RawFrame::new(vec![value; 4], 2, 2, PixelFormat::Gray8)
    }

    fn config() -> SourceConfig {
        SourceConfig {
            device: "scripted".to_string(),
            width: 2,
            height: 2,
            stop_grace: Duration::from_millis(100),
        }
    }

    fn values(recorder: &FrameRecorder) -> Vec<u8> {
        recorder.frames().iter().map(|f| f.pixels()[0]).collect()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn open_gated(frames: Vec<RawFrame>) -> (FrameSource, ReadGate, Arc<AtomicUsize>) {
        let (device, gate) = ScriptedDevice::new(frames).gated();
        let releases = device.release_counter();
        let source = FrameSource::open_with(device, config()).expect("open scripted device");
        (source, gate, releases)
    }

    #[test]
    fn delivers_frames_in_acquisition_order() {
        let device = ScriptedDevice::new(vec![gray(1), gray(2), gray(3)]);
        let releases = device.release_counter();
        let mut source = FrameSource::open_with(device, config()).unwrap();
        let recorder = FrameRecorder::new();
        source.on_frame(recorder.callback());
        source.start().unwrap();

        assert!(wait_until(|| recorder.len() == 3));
        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(values(&recorder), vec![1, 2, 3]);
        let sequences: Vec<u64> = recorder.frames().iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_read_while_paused_are_never_delivered() {
        let (mut source, gate, _releases) = open_gated(vec![gray(1), gray(2), gray(3)]);
        let recorder = FrameRecorder::new();
        source.on_frame(recorder.callback());
        source.pause();
        source.start().unwrap();

        // Tick 1 runs entirely while paused.
        assert!(gate.wait_for_read(WAIT));
        gate.allow_read();
        assert!(gate.wait_for_read(WAIT));
        assert_eq!(recorder.len(), 0);
        assert_eq!(source.stats().frames_discarded, 1);

        source.resume();
        gate.allow_read();
        assert!(gate.wait_for_read(WAIT));
        gate.allow_read();
        assert!(gate.wait_for_read(WAIT));

        drop(gate);
        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(values(&recorder), vec![2, 3]);
        let stats = source.stats();
        assert_eq!(stats.frames_read, 3);
        assert_eq!(stats.frames_delivered, 2);
    }

    #[test]
    fn toggle_pause_flips_flag() {
        let source = FrameSource::open_with(ScriptedDevice::new(Vec::new()), config()).unwrap();
        assert!(!source.is_paused());
        assert!(source.toggle_pause());
        assert!(source.is_paused());
        assert!(!source.toggle_pause());
        assert!(!source.is_paused());
    }

    #[test]
    fn second_start_is_a_no_op() {
        let (mut source, gate, releases) = open_gated(vec![gray(1)]);
        source.start().unwrap();
        assert!(gate.wait_for_read(WAIT));
        source.start().unwrap();
        assert_eq!(source.state(), SessionState::Running);

        drop(gate);
        assert_eq!(source.stop(), StopOutcome::Stopped);
        // A second loop would have released a second time.
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_failures_are_skipped() {
        use crate::device::scripted::ScriptedRead;

        let device = ScriptedDevice::with_script(vec![
            ScriptedRead::Frame(gray(1)),
            ScriptedRead::Failure("usb hiccup".to_string()),
            ScriptedRead::Frame(gray(2)),
        ]);
        let mut source = FrameSource::open_with(device, config()).unwrap();
        let recorder = FrameRecorder::new();
        source.on_frame(recorder.callback());
        source.start().unwrap();

        assert!(wait_until(|| recorder.len() == 2));
        source.stop();
        assert_eq!(values(&recorder), vec![1, 2]);
        assert_eq!(source.stats().read_failures, 1);
    }

    #[test]
    fn frames_are_resized_to_target() {
        let device = ScriptedDevice::new(vec![RawFrame::new(
            vec![50u8; 8 * 6 * 3],
            8,
            6,
            PixelFormat::Rgb24,
        )]);
        let mut source = FrameSource::open_with(
            device,
            SourceConfig {
                width: 4,
                height: 3,
                ..config()
            },
        )
        .unwrap();
        let recorder = FrameRecorder::new();
        source.on_frame(recorder.callback());
        source.start().unwrap();

        assert!(wait_until(|| recorder.len() == 1));
        source.stop();
        let frame = &recorder.frames()[0];
        assert_eq!((frame.width, frame.height), (4, 3));
    }

    #[test]
    fn open_leaves_session_idle() {
        let device = ScriptedDevice::new(Vec::new());
        let source = FrameSource::open_with(device, config()).unwrap();
        assert_eq!(source.state(), SessionState::Idle);
    }

    #[test]
    fn unavailable_device_fails_open() {
        let result = FrameSource::open_with(ScriptedDevice::unavailable(), config());
        assert!(matches!(result, Err(OpenError::DeviceUnavailable { .. })));
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let result = FrameSource::open_with(
            ScriptedDevice::new(Vec::new()),
            SourceConfig {
                width: 0,
                ..config()
            },
        );
        assert!(matches!(
            result,
            Err(OpenError::InvalidResolution { width: 0, height: 2 })
        ));
    }

    #[test]
    fn stop_before_start_releases_device() {
        let device = ScriptedDevice::new(Vec::new());
        let releases = device.release_counter();
        let mut source = FrameSource::open_with(device, config()).unwrap();

        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(source.state(), SessionState::Closed);
        assert!(matches!(source.start(), Err(SourceError::Closed)));
        drop(source);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_times_out_on_blocked_read_then_releases_once() {
        let (mut source, mut gate, releases) = open_gated(vec![gray(1)]);
        source.start().unwrap();
        assert!(gate.wait_for_read(WAIT));

        // The loop is parked inside read() and cannot observe the flag.
        assert_eq!(source.stop(), StopOutcome::TimedOut);
        assert_eq!(source.state(), SessionState::Stopping);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert!(matches!(source.start(), Err(SourceError::Stopping)));

        gate.open();
        assert!(wait_until(|| releases.load(Ordering::SeqCst) == 1));
        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(source.state(), SessionState::Closed);
        drop(source);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_running_source_releases_device() {
        let device = ScriptedDevice::new(vec![gray(1)]);
        let releases = device.release_counter();
        let mut source = FrameSource::open_with(device, config()).unwrap();
        source.start().unwrap();
        drop(source);
        assert!(wait_until(|| releases.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn sink_panic_still_releases_device() {
        let device = ScriptedDevice::new(vec![gray(1)]);
        let releases = device.release_counter();
        let mut source = FrameSource::open_with(device, config()).unwrap();
        source.on_frame(|_frame| panic!("sink failure"));
        source.start().unwrap();

        assert!(wait_until(|| releases.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| source.state() == SessionState::Closed));
        assert!(matches!(source.start(), Err(SourceError::Closed)));
        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn odd_sized_nv12_frame_is_skipped() {
        use crate::device::scripted::ScriptedRead;

        // 3x2 NV12 needs 6 luma bytes plus a 4-byte chroma row; 9 bytes is short.
        let device = ScriptedDevice::with_script(vec![
            ScriptedRead::Frame(RawFrame::new(vec![128u8; 9], 3, 2, PixelFormat::Nv12)),
            ScriptedRead::Frame(RawFrame::new(vec![7u8; 6], 3, 2, PixelFormat::Gray8)),
        ]);
        let mut source = FrameSource::open_with(device, config()).unwrap();
        let recorder = FrameRecorder::new();
        source.on_frame(recorder.callback());
        source.start().unwrap();

        assert!(wait_until(|| recorder.len() == 1));
        assert_eq!(source.state(), SessionState::Running);
        assert_eq!(source.stop(), StopOutcome::Stopped);
        assert_eq!(values(&recorder), vec![7]);
        assert_eq!(source.stats().read_failures, 1);
    }

    #[test]
    fn late_exit_after_timed_out_stop_reports_closed() {
        let (mut source, mut gate, releases) = open_gated(vec![gray(1)]);
        source.start().unwrap();
        assert!(gate.wait_for_read(WAIT));
        assert_eq!(source.stop(), StopOutcome::TimedOut);

        gate.open();
        assert!(wait_until(|| source.state() == SessionState::Closed));
        assert!(matches!(source.start(), Err(SourceError::Closed)));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
