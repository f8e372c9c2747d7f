//! Frame sinks.
//!
//! A sink is a single `FnMut(Frame)` registered with `FrameSource::on_frame`. It runs on
//! the acquisition thread, so it should return quickly: the next device read waits for
//! it. The helpers here cover the common consumers: recording frames, counting them,
//! and keeping the latest frame for a snapshot.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::Frame;

/// Boxed sink callback.
pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// Collects every delivered frame. Clones share the same storage.
#[derive(Clone, Default)]
pub struct FrameRecorder {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink callback feeding this recorder.
    pub fn callback(&self) -> impl FnMut(Frame) + Send + 'static {
        let frames = self.frames.clone();
        move |frame| lock(&frames).push(frame)
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.frames).is_empty()
    }

    /// Copy of the frames recorded so far, in delivery order.
    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.frames).clone()
    }

    pub fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *lock(&self.frames))
    }
}

/// Counts delivered frames and remembers the last sequence number and dimensions.
#[derive(Clone, Default)]
pub struct FrameCounter {
    inner: Arc<CounterInner>,
}

#[derive(Default)]
struct CounterInner {
    frames: AtomicU64,
    last_sequence: AtomicU64,
    last_dims: AtomicU64,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, frame: &Frame) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_sequence
            .store(frame.sequence, Ordering::Relaxed);
        let dims = ((frame.width as u64) << 32) | frame.height as u64;
        self.inner.last_dims.store(dims, Ordering::Relaxed);
    }

    pub fn callback(&self) -> impl FnMut(Frame) + Send + 'static {
        let counter = self.clone();
        move |frame| counter.record(&frame)
    }

    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        match self.frames() {
            0 => None,
            _ => Some(self.inner.last_sequence.load(Ordering::Relaxed)),
        }
    }

    /// Dimensions of the most recent frame.
    pub fn last_dimensions(&self) -> Option<(u32, u32)> {
        if self.frames() == 0 {
            return None;
        }
        let dims = self.inner.last_dims.load(Ordering::Relaxed);
        Some(((dims >> 32) as u32, dims as u32))
    }
}

/// Keeps only the most recent frame so it can be written out on demand.
#[derive(Clone, Default)]
pub struct SnapshotSink {
    latest: Arc<Mutex<Option<Frame>>>,
}

impl SnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        *lock(&self.latest) = Some(frame);
    }

    pub fn callback(&self) -> impl FnMut(Frame) + Send + 'static {
        let sink = self.clone();
        move |frame| sink.store(frame)
    }

    pub fn latest(&self) -> Option<Frame> {
        lock(&self.latest).clone()
    }

    /// Write the latest frame as PNG. Errors when nothing has been delivered yet.
    pub fn save_png(&self, path: &Path) -> Result<()> {
        let frame = self
            .latest()
            .ok_or_else(|| anyhow!("no frame captured yet"))?;
        frame
            .to_image()?
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("write snapshot {}", path.display()))?;
        log::info!(
            "snapshot of frame #{} ({}x{}) written to {}",
            frame.sequence,
            frame.width,
            frame.height,
            path.display()
        );
        Ok(())
    }
}

// A sink that panicked mid-delivery leaves the data intact; keep serving it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelLayout;

    fn frame(value: u8, sequence: u64) -> Frame {
        Frame::new(vec![value; 6], 2, 1, ChannelLayout::Rgb8)
            .unwrap()
            .with_sequence(sequence)
    }

    #[test]
    fn recorder_keeps_delivery_order() {
        let recorder = FrameRecorder::new();
        let mut sink = recorder.callback();
        sink(frame(1, 1));
        sink(frame(2, 2));

        let seen: Vec<u64> = recorder.frames().iter().map(|f| f.sequence).collect();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(recorder.take().len(), 2);
        assert!(recorder.is_empty());
    }

    #[test]
    fn counter_tracks_last_frame() {
        let counter = FrameCounter::new();
        assert_eq!(counter.last_sequence(), None);
        assert_eq!(counter.last_dimensions(), None);

        let mut sink = counter.callback();
        sink(frame(1, 4));
        sink(frame(1, 9));
        assert_eq!(counter.frames(), 2);
        assert_eq!(counter.last_sequence(), Some(9));
        assert_eq!(counter.last_dimensions(), Some((2, 1)));
    }

    #[test]
    fn snapshot_requires_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotSink::new();
        assert!(snapshot.save_png(&dir.path().join("empty.png")).is_err());
    }

    #[test]
    fn snapshot_writes_latest_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("latest.png");
        let snapshot = SnapshotSink::new();
        let mut sink = snapshot.callback();
        sink(frame(10, 1));
        sink(frame(200, 2));

        snapshot.save_png(&path)?;
        let written = image::open(&path)?.to_rgb8();
        assert_eq!(written.dimensions(), (2, 1));
        assert_eq!(written.into_raw(), vec![200u8; 6]);
        Ok(())
    }
}
