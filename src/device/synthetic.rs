//! Synthetic `stub://` devices.
//!
//! - `stub://pattern`: moving RGB gradient at the configured resolution
//! - `stub://fixed`: YUYV frames at a fixed 320x240, ignoring `configure`
//! - `stub://flaky`: like `pattern`, but every third read fails
//! - `stub://fail`: never connects
//!
//! Reads are paced at `SYNTHETIC_FPS` to behave like a blocking webcam read.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::CaptureDevice;
use crate::frame::{PixelFormat, RawFrame};

/// Native frame rate of synthetic devices.
pub const SYNTHETIC_FPS: u32 = 30;

const FIXED_WIDTH: u32 = 320;
const FIXED_HEIGHT: u32 = 240;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyntheticKind {
    Pattern,
    Fixed,
    Flaky,
    Fail,
}

pub struct SyntheticDevice {
    name: String,
    kind: SyntheticKind,
    width: u32,
    height: u32,
    connected: bool,
    frame_count: u64,
    read_count: u64,
    /// Simulated "scene" state so consecutive frames differ.
    scene_state: u8,
    frame_interval: Duration,
}

impl SyntheticDevice {
    pub fn new(kind: &str, width: u32, height: u32) -> Result<Self> {
        let kind = match kind {
            "pattern" => SyntheticKind::Pattern,
            "fixed" => SyntheticKind::Fixed,
            "flaky" => SyntheticKind::Flaky,
            "fail" => SyntheticKind::Fail,
            other => return Err(anyhow!("unknown synthetic device kind: {}", other)),
        };
        let (width, height) = match kind {
            SyntheticKind::Fixed => (FIXED_WIDTH, FIXED_HEIGHT),
            _ => (width, height),
        };
        Ok(Self {
            name: format!("stub://{}", kind_name(kind)),
            kind,
            width,
            height,
            connected: false,
            frame_count: 0,
            read_count: 0,
            scene_state: 0,
            frame_interval: Duration::from_millis(1000 / SYNTHETIC_FPS as u64),
        })
    }

    /// Frames produced so far.
    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    /// Generate synthetic pixel data.
    ///
    /// Mostly static background; the scene shifts every 50 frames.
    fn generate_pixels(&mut self, channels: usize) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let count = self.width as usize * self.height as usize * channels;
        let mut pixels = vec![0u8; count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<()> {
        if self.kind == SyntheticKind::Fail {
            return Err(anyhow!("{}: no such device", self.name));
        }
        self.connected = true;
        log::info!(
            "SyntheticDevice: connected to {} ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        if self.kind == SyntheticKind::Fixed {
            log::debug!(
                "SyntheticDevice: {} ignores {}x{}, staying at {}x{}",
                self.name,
                width,
                height,
                self.width,
                self.height
            );
            return Ok(());
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawFrame>> {
        if !self.connected {
            return Err(anyhow!("{} not connected", self.name));
        }
        std::thread::sleep(self.frame_interval);
        self.read_count += 1;
        if self.kind == SyntheticKind::Flaky && self.read_count % 3 == 0 {
            return Err(anyhow!("{}: simulated read failure", self.name));
        }

        self.frame_count += 1;
        let frame = match self.kind {
            SyntheticKind::Fixed => {
                let pixels = self.generate_pixels(2);
                RawFrame::new(pixels, self.width, self.height, PixelFormat::Yuyv)
            }
            _ => {
                let pixels = self.generate_pixels(3);
                RawFrame::new(pixels, self.width, self.height, PixelFormat::Rgb24)
            }
        };
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.connected {
            log::info!(
                "SyntheticDevice: released {} after {} frames",
                self.name,
                self.frame_count
            );
        }
        self.connected = false;
    }
}

fn kind_name(kind: SyntheticKind) -> &'static str {
    match kind {
        SyntheticKind::Pattern => "pattern",
        SyntheticKind::Fixed => "fixed",
        SyntheticKind::Flaky => "flaky",
        SyntheticKind::Fail => "fail",
    }
}
