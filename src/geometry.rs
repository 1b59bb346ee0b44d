//! Box geometry shared by the filter, the tracker and the preprocessor.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Width over height. Zero-height boxes report infinity.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height <= 0.0 {
            f32::INFINITY
        } else {
            self.width / self.height
        }
    }

    /// Intersection over Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between box centres.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    pub fn translate(&self, dx: f32, dy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    /// Map a box from a scaled/offset working frame back into source pixels.
    pub fn unscale(&self, scale: f32, offset_x: f32, offset_y: f32) -> BoundingBox {
        BoundingBox {
            x: self.x / scale + offset_x,
            y: self.y / scale + offset_y,
            width: self.width / scale,
            height: self.height / scale,
        }
    }

    /// True when the box lies fully inside `[0, width] x [0, height]`.
    pub fn is_within(&self, width: f32, height: f32) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.right() <= width && self.bottom() <= height
    }
}

/// Fractional region of interest inside the unit square.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub fn full() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }

    /// Clamp into the unit square, keeping at least a 1% extent.
    pub fn clamped(&self) -> Roi {
        let x = self.x.clamp(0.0, 0.99);
        let y = self.y.clamp(0.0, 0.99);
        Roi {
            x,
            y,
            width: self.width.clamp(0.01, 1.0 - x),
            height: self.height.clamp(0.01, 1.0 - y),
        }
    }

    /// Pixel rectangle `(x, y, width, height)` for a frame of the given size.
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (u32, u32, u32, u32) {
        let roi = self.clamped();
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x = (roi.x * fw).floor() as u32;
        let y = (roi.y * fh).floor() as u32;
        let w = ((roi.width * fw).round() as u32).clamp(1, frame_width.saturating_sub(x).max(1));
        let h = ((roi.height * fh).round() as u32).clamp(1, frame_height.saturating_sub(y).max(1));
        (x, y, w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_identical_and_disjoint() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let b = BoundingBox::new(100.0, 100.0, 20.0, 20.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // 50 / 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn unscale_undoes_upscale_and_roi_offset() {
        let working = BoundingBox::new(40.0, 20.0, 100.0, 80.0);
        let source = working.unscale(2.0, 64.0, 48.0);
        assert_eq!(source, BoundingBox::new(84.0, 58.0, 50.0, 40.0));
    }

    #[test]
    fn containment_is_inclusive_of_edges() {
        let b = BoundingBox::new(0.0, 0.0, 640.0, 480.0);
        assert!(b.is_within(640.0, 480.0));
        assert!(!b.translate(-0.5, 0.0).is_within(640.0, 480.0));
    }

    #[test]
    fn roi_to_pixels_stays_inside_frame() {
        let roi = Roi {
            x: 0.5,
            y: 0.25,
            width: 0.9,
            height: 0.5,
        };
        let (x, y, w, h) = roi.to_pixels(640, 480);
        assert_eq!((x, y), (320, 120));
        assert!(x + w <= 640);
        assert!(y + h <= 480);
        assert_eq!(h, 240);
    }
}
