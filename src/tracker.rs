//! IoU tracker with velocity prediction and demographic voting.
//!
//! One tracker per video source. Each cycle predicts every track forward by its
//! velocity, greedily matches predictions to detections by descending IoU,
//! updates matched tracks, holds or expires unmatched ones and opens provisional
//! tracks for unmatched detections. A held track re-matches any detection within
//! its displacement budget, overlapping or not.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::classify::{AgeGroup, FilteredDetection, Gender};
use crate::detect::DetectorKind;
use crate::geometry::BoundingBox;

/// Tracking thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Hits required before a track is reported.
    pub min_consecutive_frames: u32,
    /// Cycles a track survives without a match.
    pub hold_frames: u32,
    /// Largest centre displacement per cycle accepted for a match.
    pub max_velocity_px: f32,
    pub iou_threshold: f32,
    /// Observations kept for the demographic vote.
    pub vote_window: usize,
    /// EMA weight of the newest sample for velocity, confidence and score.
    pub smoothing: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_consecutive_frames: 2,
            hold_frames: 3,
            max_velocity_px: 120.0,
            iou_threshold: 0.2,
            vote_window: 7,
            smoothing: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Not yet stable enough to report.
    Provisional,
    /// Reported in the demographic snapshot.
    Confirmed,
    /// Missed this cycle; position extrapolated, demographics frozen.
    Held,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Observation {
    gender: Gender,
    age_group: AgeGroup,
}

/// Identity hypothesis for one person.
#[derive(Clone, Debug)]
pub struct TrackedFace {
    pub id: u64,
    pub bbox: BoundingBox,
    /// Pixels per cycle.
    pub velocity: (f32, f32),
    pub confidence: f32,
    pub face_score: f32,
    pub gender: Gender,
    pub age_group: AgeGroup,
    pub consecutive_hits: u32,
    pub missed_frames: u32,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub detector: DetectorKind,
    /// Latest raw model output, kept for per-detection labeling.
    pub raw_female_probability: f32,
    pub raw_age: f32,
    confirmed: bool,
    votes: VecDeque<Observation>,
}

impl TrackedFace {
    fn new(id: u64, det: &FilteredDetection, now_ms: u64, config: &TrackingConfig) -> Self {
        let c = &det.classification;
        let mut track = Self {
            id,
            bbox: det.bbox,
            velocity: (0.0, 0.0),
            confidence: c.confidence,
            face_score: det.score,
            gender: c.gender,
            age_group: c.age_group,
            consecutive_hits: 1,
            missed_frames: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            detector: det.detector,
            raw_female_probability: c.raw_female_probability,
            raw_age: c.raw_age,
            confirmed: false,
            votes: VecDeque::with_capacity(config.vote_window.max(1)),
        };
        track.push_vote(c.gender, c.age_group, config.vote_window);
        track.confirmed = track.consecutive_hits >= config.min_consecutive_frames;
        track
    }

    pub fn state(&self) -> TrackState {
        if self.missed_frames > 0 {
            TrackState::Held
        } else if self.confirmed {
            TrackState::Confirmed
        } else {
            TrackState::Provisional
        }
    }

    /// Cleared the stability bar at some point in its life. Held tracks keep it.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn predicted_box(&self) -> BoundingBox {
        self.bbox.translate(self.velocity.0, self.velocity.1)
    }

    fn push_vote(&mut self, gender: Gender, age_group: AgeGroup, window: usize) {
        self.votes.push_back(Observation { gender, age_group });
        while self.votes.len() > window.max(1) {
            self.votes.pop_front();
        }
        if let Some(gender) = majority(self.votes.iter().map(|o| o.gender)) {
            self.gender = gender;
        }
        if let Some(age_group) = majority(self.votes.iter().map(|o| o.age_group)) {
            self.age_group = age_group;
        }
    }

    fn apply_match(
        &mut self,
        det: &FilteredDetection,
        now_ms: u64,
        config: &TrackingConfig,
    ) {
        let alpha = config.smoothing.clamp(0.0, 1.0);
        let frames = (self.missed_frames + 1) as f32;
        // Anchor on the last confirmed position, not the extrapolated one.
        let missed = self.missed_frames as f32;
        let anchor = self
            .bbox
            .translate(-self.velocity.0 * missed, -self.velocity.1 * missed);
        let (ax, ay) = anchor.center();
        let (dx, dy) = det.bbox.center();
        let raw_velocity = ((dx - ax) / frames, (dy - ay) / frames);
        self.velocity = (
            alpha * raw_velocity.0 + (1.0 - alpha) * self.velocity.0,
            alpha * raw_velocity.1 + (1.0 - alpha) * self.velocity.1,
        );

        let c = &det.classification;
        self.bbox = det.bbox;
        self.confidence = alpha * c.confidence + (1.0 - alpha) * self.confidence;
        self.face_score = alpha * det.score + (1.0 - alpha) * self.face_score;
        self.consecutive_hits = self.consecutive_hits.saturating_add(1);
        self.missed_frames = 0;
        self.last_seen_ms = now_ms;
        self.detector = det.detector;
        self.raw_female_probability = c.raw_female_probability;
        self.raw_age = c.raw_age;
        self.push_vote(c.gender, c.age_group, config.vote_window);
        if self.consecutive_hits >= config.min_consecutive_frames {
            self.confirmed = true;
        }
    }
}

/// Most frequent value; ties go to the value observed most recently.
fn majority<T: Copy + PartialEq>(values: impl DoubleEndedIterator<Item = T> + Clone) -> Option<T> {
    let mut best: Option<(T, usize)> = None;
    // Newest first, so the first value to reach a count keeps ties.
    for candidate in values.clone().rev() {
        if best.is_some_and(|(v, _)| v == candidate) {
            continue;
        }
        let count = values.clone().filter(|v| *v == candidate).count();
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((candidate, count)),
        }
    }
    best.map(|(value, _)| value)
}

/// What changed in one tracker update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackUpdate {
    pub matched: Vec<u64>,
    pub created: Vec<u64>,
    pub held: Vec<u64>,
    pub expired: Vec<u64>,
}

/// Temporal tracker. Owned by one pipeline; reset on source change.
#[derive(Debug)]
pub struct FaceTracker {
    config: TrackingConfig,
    tracks: Vec<TrackedFace>,
    next_id: u64,
}

impl FaceTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Run one cycle against this frame's filtered detections.
    pub fn update(&mut self, detections: &[FilteredDetection], now_ms: u64) -> TrackUpdate {
        let predicted: Vec<BoundingBox> = self.tracks.iter().map(|t| t.predicted_box()).collect();

        // (iou, centre distance, track, detection)
        let mut candidates: Vec<(f32, f32, usize, usize)> = Vec::new();
        for (ti, (track, pred)) in self.tracks.iter().zip(&predicted).enumerate() {
            let allowed = self.config.max_velocity_px * (track.missed_frames + 1) as f32;
            for (di, det) in detections.iter().enumerate() {
                let iou = pred.iou(&det.bbox);
                let distance = pred.center_distance(&det.bbox);
                if distance > allowed {
                    continue;
                }
                // Held tracks have no overlap to go on after a long occlusion;
                // the displacement budget alone gates them.
                if track.missed_frames > 0 || iou > self.config.iou_threshold {
                    candidates.push((iou, distance, ti, di));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.total_cmp(&b.1)));

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut update = TrackUpdate::default();

        for (_, _, ti, di) in candidates {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            self.tracks[ti].apply_match(&detections[di], now_ms, &self.config);
            update.matched.push(self.tracks[ti].id);
        }

        let hold_frames = self.config.hold_frames;
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if track_used[ti] {
                continue;
            }
            track.missed_frames += 1;
            if track.missed_frames > hold_frames {
                update.expired.push(track.id);
            } else {
                track.bbox = predicted[ti];
                update.held.push(track.id);
            }
        }
        self.tracks.retain(|t| t.missed_frames <= hold_frames);

        for (di, det) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(TrackedFace::new(id, det, now_ms, &self.config));
            update.created.push(id);
        }

        update
    }

    pub fn tracks(&self) -> &[TrackedFace] {
        &self.tracks
    }

    /// Tracks that cleared the stability bar.
    pub fn confirmed(&self) -> impl Iterator<Item = &TrackedFace> {
        self.tracks.iter().filter(|t| t.is_confirmed())
    }

    pub fn get(&self, id: u64) -> Option<&TrackedFace> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop every track. Ids keep increasing so labels never collide across sources.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}
