//! Demographic snapshot handed to the ad-queue consumer.
//!
//! Derived from the live track set on every cycle. No history is kept here;
//! cumulative totals belong to the consumer.

use serde::Serialize;

use crate::classify::{AgeGroup, Gender};
use crate::detect::DetectorKind;
use crate::geometry::BoundingBox;
use crate::tracker::{FaceTracker, TrackState, TrackedFace};

/// Point-in-time counts over confirmed tracks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DemographicCounts {
    pub male: u32,
    pub female: u32,
    pub kid: u32,
    pub young: u32,
    pub adult: u32,
}

impl DemographicCounts {
    /// People counted. Every person has exactly one gender.
    pub fn total(&self) -> u32 {
        self.male + self.female
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn add(&mut self, gender: Gender, age_group: AgeGroup) {
        match gender {
            Gender::Male => self.male += 1,
            Gender::Female => self.female += 1,
        }
        match age_group {
            AgeGroup::Kid => self.kid += 1,
            AgeGroup::Young => self.young += 1,
            AgeGroup::Adult => self.adult += 1,
        }
    }
}

/// Per-person output of a cycle, with enough identity for per-detection labeling.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub tracking_id: u64,
    pub bbox: BoundingBox,
    pub gender: Gender,
    pub age_group: AgeGroup,
    pub confidence: f32,
    pub face_score: f32,
    pub last_seen_ms: u64,
    pub state: TrackState,
    pub detector: DetectorKind,
    /// Uncorrected model output from the latest match.
    pub raw_female_probability: f32,
    pub raw_age: f32,
}

impl From<&TrackedFace> for DetectionResult {
    fn from(track: &TrackedFace) -> Self {
        Self {
            tracking_id: track.id,
            bbox: track.bbox,
            gender: track.gender,
            age_group: track.age_group,
            confidence: track.confidence,
            face_score: track.face_score,
            last_seen_ms: track.last_seen_ms,
            state: track.state(),
            detector: track.detector,
            raw_female_probability: track.raw_female_probability,
            raw_age: track.raw_age,
        }
    }
}

/// Snapshot over confirmed tracks only; provisional tracks never count.
pub fn current_snapshot(tracker: &FaceTracker) -> DemographicCounts {
    let mut counts = DemographicCounts::default();
    for track in tracker.confirmed() {
        counts.add(track.gender, track.age_group);
    }
    counts
}

/// Results for confirmed tracks, ordered by tracking id.
pub fn confirmed_results(tracker: &FaceTracker) -> Vec<DetectionResult> {
    let mut results: Vec<DetectionResult> = tracker.confirmed().map(DetectionResult::from).collect();
    results.sort_by_key(|r| r.tracking_id);
    results
}
