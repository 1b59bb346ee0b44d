//! Transient frame container.
//!
//! - `Frame`: owned RGB24 pixels for exactly one detection cycle. No `Clone`, no
//!   `Serialize`; pixels are zeroized when the frame is dropped.
//! - `FrameMapping`: how a working frame (ROI crop, upscale) relates to the source
//!   frame, so detections can be mapped back into source pixels.
//!
//! Frames are never persisted. Sources hand them to the pipeline, the pipeline
//! drops them at the end of the cycle.

use anyhow::{anyhow, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

use crate::geometry::BoundingBox;

/// Owned RGB24 frame.
pub struct Frame {
    /// Row-major RGB24 pixels.
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// Wall-clock capture time in milliseconds since the epoch.
    captured_at_ms: u64,
}

// Explicitly NOT implementing Clone or Serialize.

impl Frame {
    /// Wrap RGB24 pixels. Fails when the buffer length does not match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at_ms: now_ms(),
        })
    }

    /// Uniformly filled frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let count = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(count * 3);
        for _ in 0..count {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height)
    }

    pub fn from_image(image: RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    pub fn with_capture_time(mut self, captured_at_ms: u64) -> Self {
        self.captured_at_ms = captured_at_ms;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    /// Read-only pixel access for detectors. Implementations must not retain the slice.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Borrowed image view for `image::imageops`.
    pub fn as_image(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
    }

    #[inline]
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Rec.601 luma of one pixel.
    #[inline]
    pub fn luma(&self, x: u32, y: u32) -> f32 {
        let [r, g, b] = self.rgb(x, y);
        0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
    }

    /// Copy out a pixel rectangle. The rectangle is clipped to the frame.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Frame> {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let width = width.min(self.width - x).max(1);
        let height = height.min(self.height - y).max(1);

        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for row in y..y + height {
            let start = row as usize * stride + x as usize * 3;
            data.extend_from_slice(&self.data[start..start + width as usize * 3]);
        }
        Ok(Frame::new(data, width, height)?.with_capture_time(self.captured_at_ms))
    }

    /// Pixel rectangle covered by a box, clipped to the frame. `None` when empty.
    pub fn clip_box(&self, bbox: &BoundingBox) -> Option<(u32, u32, u32, u32)> {
        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = (bbox.right().min(self.width as f32)).ceil() as u32;
        let y1 = (bbox.bottom().min(self.height as f32)).ceil() as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    pub(crate) fn into_parts(mut self) -> (Vec<u8>, u32, u32) {
        (std::mem::take(&mut self.data), self.width, self.height)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Frames are transient; scrub pixels before the allocation is returned.
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .finish_non_exhaustive()
    }
}

/// Relationship between a working frame and the source frame it was derived from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMapping {
    /// Working pixels per source pixel.
    pub scale: f32,
    /// ROI top-left corner in source pixels.
    pub offset_x: f32,
    pub offset_y: f32,
}

impl FrameMapping {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        bbox.unscale(self.scale, self.offset_x, self.offset_y)
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset_x == 0.0 && self.offset_y == 0.0
    }
}

impl Default for FrameMapping {
    fn default() -> Self {
        Self::identity()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_ok());
        assert!(Frame::new(Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn crop_copies_rectangle() {
        let mut data = Vec::new();
        for y in 0..4u8 {
            for x in 0..4u8 {
                data.extend_from_slice(&[x, y, 0]);
            }
        }
        let frame = Frame::new(data, 4, 4).unwrap();
        let crop = frame.crop(1, 2, 2, 2).unwrap();
        assert_eq!(crop.width(), 2);
        assert_eq!(crop.height(), 2);
        assert_eq!(crop.rgb(0, 0), [1, 2, 0]);
        assert_eq!(crop.rgb(1, 1), [2, 3, 0]);
    }

    #[test]
    fn crop_clips_to_frame() {
        let frame = Frame::filled(10, 10, [5, 5, 5]).unwrap();
        let crop = frame.crop(8, 8, 10, 10).unwrap();
        assert_eq!((crop.width(), crop.height()), (2, 2));
    }

    #[test]
    fn image_view_matches_dimensions() {
        let frame = Frame::filled(6, 3, [1, 2, 3]).unwrap();
        let view = frame.as_image().unwrap();
        assert_eq!(view.dimensions(), (6, 3));
        assert_eq!(view.get_pixel(5, 2).0, [1, 2, 3]);
    }

    #[test]
    fn mapping_identity_round_trip() {
        let mapping = FrameMapping::identity();
        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(mapping.to_source(&b), b);
        assert!(mapping.is_identity());
    }
}
