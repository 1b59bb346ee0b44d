use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Pixel layouts accepted from external capturers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    /// Typical screen-capture layout.
    Bgra32,
    Nv12,
}

impl PixelFormat {
    /// Buffer length for a frame of the given size.
    pub fn frame_len(self, width: u32, height: u32) -> Result<usize> {
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let len = match self {
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => pixels.checked_mul(4),
            PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
        };
        len.ok_or_else(|| anyhow!("frame dimensions overflow"))
    }
}

/// Convert any supported layout to row-major RGB24.
pub fn normalize_to_rgb(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    let expected = format.frame_len(width, height)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }
    match format {
        PixelFormat::Rgb24 => Ok(pixels.to_vec()),
        PixelFormat::Rgba32 => Ok(pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()),
        PixelFormat::Bgra32 => Ok(pixels
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect()),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 || h % 2 != 0 {
        return Err(anyhow!("NV12 frames need even dimensions, got {}x{}", w, h));
    }
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
