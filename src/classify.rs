//! Demographic post-processing of filtered detections.
//!
//! Age cut points are fixed business rules. Gender correction is a headroom-scaled
//! boost toward "female" plus optional advisory heuristics; with the boost at zero
//! and heuristics off the model's estimate passes through untouched.

use serde::{Deserialize, Serialize};

use crate::detect::{DetectorKind, RawDetection};
use crate::filter::region_stats;
use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// Upper bound for the configurable female boost.
pub const MAX_FEMALE_BOOST: f32 = 0.30;

const KID_MAX_AGE: f32 = 13.0;
const YOUNG_MAX_AGE: f32 = 35.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Kid,
    Young,
    Adult,
}

impl AgeGroup {
    /// `kid` below 13, `young` below 35, `adult` otherwise. Non-finite ages count as adult.
    pub fn from_age(age: f32) -> Self {
        if !age.is_finite() {
            return AgeGroup::Adult;
        }
        if age < KID_MAX_AGE {
            AgeGroup::Kid
        } else if age < YOUNG_MAX_AGE {
            AgeGroup::Young
        } else {
            AgeGroup::Adult
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

/// Gender-bias correction settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiasCorrection {
    /// Boost factor in `0..=0.30`.
    pub female_boost: f32,
    /// Long-hair evidence from the regions beside the face.
    pub hair_heuristic: bool,
    /// Narrow-face evidence from the box aspect ratio.
    pub shape_heuristic: bool,
    /// Headroom fraction each positive heuristic adds.
    pub heuristic_weight: f32,
}

impl BiasCorrection {
    /// Raw model output, for A/B comparison.
    pub fn disabled() -> Self {
        Self {
            female_boost: 0.0,
            hair_heuristic: false,
            shape_heuristic: false,
            heuristic_weight: 0.0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.female_boost <= 0.0 && !self.hair_heuristic && !self.shape_heuristic
    }
}

impl Default for BiasCorrection {
    fn default() -> Self {
        Self {
            female_boost: 0.15,
            hair_heuristic: false,
            shape_heuristic: false,
            heuristic_weight: 0.1,
        }
    }
}

/// Post-processed demographic estimate for one detection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Classification {
    pub gender: Gender,
    pub age_group: AgeGroup,
    /// Probability of the chosen gender after correction.
    pub confidence: f32,
    pub female_probability: f32,
    pub raw_female_probability: f32,
    pub raw_age: f32,
}

/// A detection that passed filtering, in source-frame pixels, with demographics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilteredDetection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub detector: DetectorKind,
    pub classification: Classification,
}

/// `min(1, p + b * (1 - p))` with `b` clamped to `0..=0.30`.
pub fn boost_female_probability(raw: f32, boost: f32) -> f32 {
    let b = boost.clamp(0.0, MAX_FEMALE_BOOST);
    (raw + b * (1.0 - raw)).min(1.0)
}

#[derive(Clone, Debug)]
pub struct DemographicClassifier {
    correction: BiasCorrection,
}

impl DemographicClassifier {
    pub fn new(correction: BiasCorrection) -> Self {
        Self { correction }
    }

    pub fn correction(&self) -> &BiasCorrection {
        &self.correction
    }

    /// Classify a detection whose box is in `frame`'s pixels.
    ///
    /// `frame` is only consulted by the hair heuristic.
    pub fn classify(&self, det: &RawDetection, frame: Option<&Frame>) -> Classification {
        let raw = det.gender.female_probability();
        let mut p = boost_female_probability(raw, self.correction.female_boost);

        let weight = self.correction.heuristic_weight.clamp(0.0, 1.0);
        if weight > 0.0 {
            if self.correction.shape_heuristic && narrow_face(&det.bbox) {
                p += weight * (1.0 - p);
            }
            if self.correction.hair_heuristic {
                if let Some(frame) = frame {
                    if long_hair_evidence(frame, &det.bbox) {
                        p += weight * (1.0 - p);
                    }
                }
            }
        }
        let p = p.clamp(raw, 1.0);

        let gender = if p >= 0.5 { Gender::Female } else { Gender::Male };
        Classification {
            gender,
            age_group: AgeGroup::from_age(det.age),
            confidence: p.max(1.0 - p),
            female_probability: p,
            raw_female_probability: raw,
            raw_age: det.age,
        }
    }

    pub fn classify_detection(
        &self,
        det: &RawDetection,
        detector: DetectorKind,
        frame: Option<&Frame>,
    ) -> FilteredDetection {
        FilteredDetection {
            bbox: det.bbox,
            score: det.score,
            detector,
            classification: self.classify(det, frame),
        }
    }
}

fn narrow_face(bbox: &BoundingBox) -> bool {
    bbox.aspect_ratio() < 0.82
}

/// Dark, non-skin pixels on both sides of the lower face suggest long hair.
fn long_hair_evidence(frame: &Frame, bbox: &BoundingBox) -> bool {
    let side_w = bbox.width * 0.3;
    let top = bbox.y + bbox.height * 0.3;
    let height = bbox.height * 0.9;
    let left = BoundingBox::new(bbox.x - side_w, top, side_w, height);
    let right = BoundingBox::new(bbox.right(), top, side_w, height);

    let hair_like = |region: &BoundingBox| {
        region_stats(frame, region)
            .map(|s| s.dark_ratio >= 0.45 && s.skin_ratio < 0.3)
            .unwrap_or(false)
    };
    hair_like(&left) && hair_like(&right)
}
