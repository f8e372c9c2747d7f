use anyhow::{anyhow, Result};

use crate::frame::{expected_len, ChannelLayout, Frame, PixelFormat, RawFrame};

/// Convert a device frame into a normalized `Frame`.
pub(crate) fn normalize(raw: RawFrame) -> Result<Frame> {
    let RawFrame {
        data,
        width,
        height,
        format,
    } = raw;
    match format {
        PixelFormat::Rgb24 => Frame::new(data, width, height, ChannelLayout::Rgb8),
        PixelFormat::Bgr24 => Frame::new(data, width, height, ChannelLayout::Bgr8),
        PixelFormat::Gray8 => Frame::new(data, width, height, ChannelLayout::Gray8),
        PixelFormat::Nv12 => {
            let rgb = nv12_to_rgb(&data, width, height)?;
            Frame::new(rgb, width, height, ChannelLayout::Rgb8)
        }
        PixelFormat::Yuyv => {
            let rgb = yuyv_to_rgb(&data, width, height)?;
            Frame::new(rgb, width, height, ChannelLayout::Rgb8)
        }
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(anyhow!("NV12 frame has zero size {}x{}", width, height));
    }
    let w = width as usize;
    let h = height as usize;
    let y_plane = expected_len(width, height, 1)?;
    // Interleaved UV at half resolution, rounded up for odd dimensions.
    let uv_stride = w.div_ceil(2) * 2;
    let expected = uv_stride
        .checked_mul(h.div_ceil(2))
        .and_then(|uv_plane| uv_plane.checked_add(y_plane))
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let (luma, chroma) = pixels.split_at(y_plane);
    let mut rgb = vec![0u8; expected_len(width, height, 3)?];
    for (j, (row, out)) in luma.chunks_exact(w).zip(rgb.chunks_exact_mut(w * 3)).enumerate() {
        let uv_row = &chroma[(j / 2) * uv_stride..][..uv_stride];
        for (i, (&y, px)) in row.iter().zip(out.chunks_exact_mut(3)).enumerate() {
            let uv = &uv_row[(i / 2) * 2..][..2];
            write_rgb(px, y, uv[0], uv[1]);
        }
    }

    Ok(rgb)
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    let expected = expected_len(width, height, 2)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; expected_len(width, height, 3)?];
    for (quad, out) in pixels.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        write_rgb(&mut out[..3], y0, u, v);
        write_rgb(&mut out[3..], y1, u, v);
    }

    Ok(rgb)
}

// BT.601 full range.
fn write_rgb(out: &mut [u8], y: u8, u: u8, v: u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    out[0] = clamp_to_u8(y + 1.402_f32 * v);
    out[1] = clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v);
    out[2] = clamp_to_u8(y + 1.772_f32 * u);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
