//! Frame types.
//!
//! - `RawFrame`: bytes as a capture device produced them, tagged with the device pixel format.
//! - `Frame`: normalized, immutable snapshot handed to sinks.
//!
//! A `Frame` is produced once per successful acquisition and moved into the sink on
//! delivery. The frame source keeps no reference to delivered frames.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, Pixel, Rgb, Rgba};
use std::fmt;

use crate::device::normalize;

/// Pixel formats a capture device may emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb24,
    /// Packed 8-bit BGR (OpenCV-style webcams).
    Bgr24,
    /// Single 8-bit luma plane.
    Gray8,
    /// Y plane followed by interleaved UV at half resolution.
    Nv12,
    /// Packed 4:2:2, two pixels per `Y0 U Y1 V` quadruple.
    Yuyv,
}

/// Channel layout of a normalized `Frame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelLayout {
    Gray8,
    Bgr8,
    Rgb8,
    Bgra8,
}

impl ChannelLayout {
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Gray8 => 1,
            ChannelLayout::Bgr8 | ChannelLayout::Rgb8 => 3,
            ChannelLayout::Bgra8 => 4,
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame: device output
// ----------------------------------------------------------------------------

/// A frame exactly as read from a device.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }

    /// Convert device pixels into a `Frame` layout.
    ///
    /// Packed RGB/BGR/gray buffers pass through after a length check; NV12 and YUYV are
    /// converted to RGB.
    pub fn into_frame(self) -> Result<Frame> {
        normalize::normalize(self)
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Frame: immutable snapshot delivered to sinks
// ----------------------------------------------------------------------------

/// Immutable frame snapshot.
///
/// Pixel bytes are only readable; there is no mutable accessor. `sequence` is assigned by
/// the frame source in acquisition order, so gaps show frames discarded while paused.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub sequence: u64,
}

impl Frame {
    /// Build a frame, checking that `data` holds exactly `width * height * channels` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: ChannelLayout) -> Result<Self> {
        let expected = expected_len(width, height, layout.channels())?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                layout,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            sequence: 0,
        })
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    /// Resize to `width` x `height` with a triangle filter. Returns `self` untouched when
    /// the dimensions already match.
    pub fn resized(self, width: u32, height: u32) -> Result<Frame> {
        if self.width == width && self.height == height {
            return Ok(self);
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize frame to {}x{}", width, height));
        }
        let (src_w, src_h) = (self.width, self.height);
        let data = match self.layout {
            ChannelLayout::Gray8 => resize_pixels::<Luma<u8>>(self.data, src_w, src_h, width, height)?,
            ChannelLayout::Bgr8 | ChannelLayout::Rgb8 => {
                resize_pixels::<Rgb<u8>>(self.data, src_w, src_h, width, height)?
            }
            ChannelLayout::Bgra8 => {
                resize_pixels::<Rgba<u8>>(self.data, src_w, src_h, width, height)?
            }
        };
        Ok(Self {
            data,
            width,
            height,
            layout: self.layout,
            sequence: self.sequence,
        })
    }

    /// Convert to an `image::DynamicImage` for display or encoding.
    ///
    /// BGR and BGRA frames have their red and blue channels swapped so the result is
    /// always in RGB order.
    pub fn to_image(&self) -> Result<DynamicImage> {
        let (w, h) = (self.width, self.height);
        let image = match self.layout {
            ChannelLayout::Gray8 => DynamicImage::ImageLuma8(
                ImageBuffer::from_raw(w, h, self.data.clone()).ok_or_else(buffer_error)?,
            ),
            ChannelLayout::Rgb8 => DynamicImage::ImageRgb8(
                ImageBuffer::from_raw(w, h, self.data.clone()).ok_or_else(buffer_error)?,
            ),
            ChannelLayout::Bgr8 => DynamicImage::ImageRgb8(
                ImageBuffer::from_raw(w, h, swap_red_blue(&self.data, 3))
                    .ok_or_else(buffer_error)?,
            ),
            ChannelLayout::Bgra8 => DynamicImage::ImageRgba8(
                ImageBuffer::from_raw(w, h, swap_red_blue(&self.data, 4))
                    .ok_or_else(buffer_error)?,
            ),
        };
        Ok(image)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expected_len(width: u32, height: u32, channels: usize) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn resize_pixels<P>(
    data: Vec<u8>,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Result<Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let src: ImageBuffer<P, Vec<u8>> =
        ImageBuffer::from_raw(src_w, src_h, data).ok_or_else(buffer_error)?;
    Ok(imageops::resize(&src, dst_w, dst_h, FilterType::Triangle).into_raw())
}

fn swap_red_blue(data: &[u8], stride: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    for px in out.chunks_exact_mut(stride) {
        px.swap(0, 2);
    }
    out
}

fn buffer_error() -> anyhow::Error {
    anyhow!("frame buffer does not match its dimensions")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
