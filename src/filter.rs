//! False-positive guard.
//!
//! Six independent numeric conditions, all evaluated in source-frame pixels, plus
//! an optional texture/skin-tone check that is tuned separately. A detection
//! survives iff every enabled condition holds.

use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;
use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// Numeric filter bounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterBounds {
    pub min_face_score: f32,
    pub min_face_size_px: f32,
    /// Box area as a percentage of frame area.
    pub min_face_size_percent: f32,
    pub max_face_size_percent: f32,
    /// Width over height.
    pub aspect_ratio_min: f32,
    pub aspect_ratio_max: f32,
}

/// Texture/skin-tone heuristic thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextureCheck {
    pub enabled: bool,
    /// Mean absolute luma gradient below which a region counts as flat.
    pub min_edge_energy: f32,
    /// Minimum fraction of skin-toned pixels. `0` disables the skin test.
    pub min_skin_ratio: f32,
}

impl TextureCheck {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_edge_energy: 4.0,
            min_skin_ratio: 0.0,
        }
    }
}

impl Default for TextureCheck {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Why a detection was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rejection {
    LowScore,
    TooSmall,
    BelowMinArea,
    AboveMaxArea,
    AspectRatio,
    OutsideFrame,
    FlatTexture,
    NotSkinTone,
}

/// Survivors and rejection tallies for one pass.
#[derive(Clone, Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<RawDetection>,
    pub rejected: Vec<(BoundingBox, Rejection)>,
}

#[derive(Clone, Debug)]
pub struct FaceFilter {
    bounds: FilterBounds,
    sensitivity: f32,
    texture: TextureCheck,
}

impl FaceFilter {
    pub fn new(bounds: FilterBounds, sensitivity: f32, texture: TextureCheck) -> Self {
        Self {
            bounds,
            sensitivity,
            texture,
        }
    }

    pub fn bounds(&self) -> &FilterBounds {
        &self.bounds
    }

    /// `min(configured min face score, sensitivity)`.
    pub fn effective_min_score(&self) -> f32 {
        self.bounds.min_face_score.min(self.sensitivity)
    }

    /// The six numeric conditions. `det.bbox` must already be in source pixels.
    pub fn check(&self, det: &RawDetection, frame_width: u32, frame_height: u32) -> Result<(), Rejection> {
        let b = &self.bounds;
        let bbox = &det.bbox;

        if !(det.score >= self.effective_min_score()) {
            return Err(Rejection::LowScore);
        }
        if bbox.width < b.min_face_size_px || bbox.height < b.min_face_size_px {
            return Err(Rejection::TooSmall);
        }
        let frame_area = frame_width as f32 * frame_height as f32;
        let area_percent = if frame_area > 0.0 {
            bbox.area() / frame_area * 100.0
        } else {
            f32::INFINITY
        };
        if area_percent < b.min_face_size_percent {
            return Err(Rejection::BelowMinArea);
        }
        if area_percent > b.max_face_size_percent {
            return Err(Rejection::AboveMaxArea);
        }
        let aspect = bbox.aspect_ratio();
        if aspect < b.aspect_ratio_min || aspect > b.aspect_ratio_max {
            return Err(Rejection::AspectRatio);
        }
        if !bbox.is_within(frame_width as f32, frame_height as f32) {
            return Err(Rejection::OutsideFrame);
        }
        Ok(())
    }

    /// Best-effort texture and skin-tone check on the source pixels under the box.
    pub fn check_texture(&self, det: &RawDetection, frame: &Frame) -> Result<(), Rejection> {
        if !self.texture.enabled {
            return Ok(());
        }
        let Some(stats) = region_stats(frame, &det.bbox) else {
            return Ok(());
        };
        if stats.edge_energy < self.texture.min_edge_energy {
            return Err(Rejection::FlatTexture);
        }
        if self.texture.min_skin_ratio > 0.0 && stats.skin_ratio < self.texture.min_skin_ratio {
            return Err(Rejection::NotSkinTone);
        }
        Ok(())
    }

    /// Apply every condition to detections already mapped into `frame`'s pixels.
    pub fn apply(&self, detections: Vec<RawDetection>, frame: &Frame) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for det in detections {
            let verdict = self
                .check(&det, frame.width(), frame.height())
                .and_then(|()| self.check_texture(&det, frame));
            match verdict {
                Ok(()) => outcome.kept.push(det),
                Err(reason) => {
                    log::trace!("rejected {:?}: {:?}", det.bbox, reason);
                    outcome.rejected.push((det.bbox, reason));
                }
            }
        }
        outcome
    }
}

/// Luma texture and skin statistics for a box.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RegionStats {
    pub edge_energy: f32,
    pub skin_ratio: f32,
    pub dark_ratio: f32,
}

/// Sampled on a grid of at most 48x48 points so cost is independent of box size.
pub(crate) fn region_stats(frame: &Frame, bbox: &BoundingBox) -> Option<RegionStats> {
    let (x0, y0, w, h) = frame.clip_box(bbox)?;
    if w < 3 || h < 3 {
        return None;
    }
    let step_x = (w / 48).max(1);
    let step_y = (h / 48).max(1);

    let mut gradient_sum = 0.0;
    let mut gradient_count = 0u32;
    let mut skin = 0u32;
    let mut dark = 0u32;
    let mut samples = 0u32;

    let mut y = y0;
    while y < y0 + h - 1 {
        let mut x = x0;
        while x < x0 + w - 1 {
            let l = frame.luma(x, y);
            gradient_sum += (frame.luma(x + 1, y) - l).abs() + (frame.luma(x, y + 1) - l).abs();
            gradient_count += 1;

            let rgb = frame.rgb(x, y);
            if is_skin_tone(rgb) {
                skin += 1;
            }
            if l < 80.0 {
                dark += 1;
            }
            samples += 1;
            x += step_x;
        }
        y += step_y;
    }
    if samples == 0 {
        return None;
    }
    Some(RegionStats {
        edge_energy: gradient_sum / gradient_count.max(1) as f32,
        skin_ratio: skin as f32 / samples as f32,
        dark_ratio: dark as f32 / samples as f32,
    })
}

/// Chroma-range skin test in YCbCr (`77 <= Cb <= 127`, `133 <= Cr <= 173`).
pub(crate) fn is_skin_tone([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::GenderSignal;

    fn bounds() -> FilterBounds {
        FilterBounds {
            min_face_score: 0.5,
            min_face_size_px: 40.0,
            min_face_size_percent: 0.5,
            max_face_size_percent: 35.0,
            aspect_ratio_min: 0.6,
            aspect_ratio_max: 1.6,
        }
    }

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> RawDetection {
        RawDetection::new(BoundingBox::new(x, y, w, h), score, 30.0, GenderSignal::Unknown)
    }

    fn filter() -> FaceFilter {
        FaceFilter::new(bounds(), 0.6, TextureCheck::disabled())
    }

    #[test]
    fn clean_face_passes() {
        assert_eq!(filter().check(&det(270.0, 190.0, 100.0, 100.0, 0.9), 640, 480), Ok(()));
    }

    #[test]
    fn each_condition_rejects_independently() {
        let f = filter();
        assert_eq!(f.check(&det(0.0, 0.0, 100.0, 100.0, 0.4), 640, 480), Err(Rejection::LowScore));
        assert_eq!(f.check(&det(0.0, 0.0, 30.0, 100.0, 0.9), 640, 480), Err(Rejection::TooSmall));
        assert_eq!(f.check(&det(0.0, 0.0, 40.0, 40.0, 0.9), 1920, 1080), Err(Rejection::BelowMinArea));
        assert_eq!(f.check(&det(0.0, 0.0, 100.0, 200.0, 0.9), 640, 480), Err(Rejection::AspectRatio));
        assert_eq!(f.check(&det(600.0, 0.0, 100.0, 100.0, 0.9), 640, 480), Err(Rejection::OutsideFrame));
    }

    #[test]
    fn oversized_box_rejected() {
        // 40% of a 640x480 frame.
        let side = (640.0f32 * 480.0 * 0.40).sqrt();
        assert_eq!(
            filter().check(&det(10.0, 10.0, side, side, 0.95), 640, 480),
            Err(Rejection::AboveMaxArea)
        );
    }

    #[test]
    fn effective_score_is_minimum_of_score_and_sensitivity() {
        let f = FaceFilter::new(bounds(), 0.3, TextureCheck::disabled());
        assert_eq!(f.effective_min_score(), 0.3);
        assert!(f.check(&det(100.0, 100.0, 100.0, 100.0, 0.32), 640, 480).is_ok());
    }

    #[test]
    fn relaxing_thresholds_never_drops_a_survivor() {
        let strict = filter();
        let relaxed = FaceFilter::new(
            FilterBounds {
                min_face_score: 0.3,
                min_face_size_px: 20.0,
                min_face_size_percent: 0.1,
                max_face_size_percent: 50.0,
                aspect_ratio_min: 0.4,
                aspect_ratio_max: 2.0,
            },
            0.6,
            TextureCheck::disabled(),
        );
        for score in [0.2, 0.45, 0.55, 0.9] {
            for w in [10.0, 45.0, 90.0, 200.0, 400.0] {
                for h in [10.0, 50.0, 100.0, 250.0] {
                    for x in [-5.0, 0.0, 200.0, 500.0] {
                        let d = det(x, 20.0, w, h, score);
                        if strict.check(&d, 640, 480).is_ok() {
                            assert!(relaxed.check(&d, 640, 480).is_ok(), "{:?}", d);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn texture_check_rejects_flat_surface() {
        let frame = Frame::filled(200, 200, [120, 120, 120]).unwrap();
        let f = FaceFilter::new(
            bounds(),
            0.6,
            TextureCheck {
                enabled: true,
                min_edge_energy: 2.0,
                min_skin_ratio: 0.0,
            },
        );
        let d = det(50.0, 50.0, 80.0, 80.0, 0.9);
        assert_eq!(f.check_texture(&d, &frame), Err(Rejection::FlatTexture));

        let disabled = filter();
        assert_eq!(disabled.check_texture(&d, &frame), Ok(()));
    }

    #[test]
    fn skin_tone_classification() {
        assert!(is_skin_tone([224, 172, 140]));
        assert!(!is_skin_tone([40, 90, 200]));
        assert!(!is_skin_tone([120, 120, 120]));
    }

    #[test]
    fn apply_partitions_detections() {
        let frame = Frame::filled(640, 480, [0, 0, 0]).unwrap();
        let outcome = filter().apply(
            vec![det(100.0, 100.0, 100.0, 100.0, 0.9), det(0.0, 0.0, 10.0, 10.0, 0.9)],
            &frame,
        );
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.rejected, vec![(BoundingBox::new(0.0, 0.0, 10.0, 10.0), Rejection::TooSmall)]);
    }
}
