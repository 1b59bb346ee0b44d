//! Multi-pass detection.
//!
//! Pass 1 runs the session's detectors on the source frame (or its ROI crop).
//! Pass 2 rescues empty CCTV frames with an enhanced, upscaled frame and a lower
//! threshold. Pass 3 retries the fast detector at an alternate input size with a
//! floored threshold. Passes run strictly in order and the first one with
//! surviving detections wins.

use serde::{Deserialize, Serialize};

use crate::detect::{DetectorKind, DetectorMode, DetectorSet, RawDetection};
use crate::error::PipelineError;
use crate::filter::FaceFilter;
use crate::frame::{Frame, FrameMapping};
use crate::preprocess::Preprocessor;

pub const PASS_STANDARD: u8 = 1;
pub const PASS_RESCUE: u8 = 2;
pub const PASS_FALLBACK: u8 = 3;

/// Input sizes and thresholds for the three passes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub tiny_input_size: u32,
    pub ssd_input_size: u32,
    /// Pass 2 runs at all. Only CCTV/video sessions enable it.
    pub rescue_enabled: bool,
    /// Fast-detector input size inside the rescue pass.
    pub rescue_input_size: u32,
    pub fallback_enabled: bool,
    pub fallback_input_size: u32,
    /// Subtracted from `max(min_face_score, sensitivity)` for pass 1.
    pub score_margin: f32,
    /// Further drop applied in the rescue pass.
    pub rescue_threshold_drop: f32,
    /// Pass 3 threshold never exceeds this.
    pub fallback_floor: f32,
    /// No pass ever runs below this.
    pub absolute_min_score: f32,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            tiny_input_size: 416,
            ssd_input_size: 512,
            rescue_enabled: false,
            rescue_input_size: 608,
            fallback_enabled: false,
            fallback_input_size: 320,
            score_margin: 0.05,
            rescue_threshold_drop: 0.1,
            fallback_floor: 0.2,
            absolute_min_score: 0.15,
        }
    }
}

impl PassConfig {
    /// Every input size `kind` can be run at under this config, for plan warm-up.
    pub fn input_sizes(&self, kind: DetectorKind) -> Vec<u32> {
        let mut sizes = match kind {
            DetectorKind::Tiny => vec![self.tiny_input_size],
            DetectorKind::Ssd => vec![self.ssd_input_size],
        };
        if self.rescue_enabled && kind == DetectorKind::Tiny {
            sizes.push(self.rescue_input_size);
        }
        // Fallback runs on whichever detector remains.
        if self.fallback_enabled {
            sizes.push(self.fallback_input_size);
        }
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }
}

/// One detector invocation inside a pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PassAttempt {
    pub pass: u8,
    pub detector: DetectorKind,
    pub input_size: u32,
    pub threshold: f32,
    pub raw_count: usize,
    pub kept_count: usize,
}

/// Result of one multi-pass run.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Pass that produced `detections`, or the last pass attempted. `0` if none ran.
    pub pass: u8,
    pub detector: Option<DetectorKind>,
    /// Survivors of the filter, in source-frame pixels.
    pub detections: Vec<RawDetection>,
    /// Raw detections of the selected attempt, before filtering.
    pub raw_count: usize,
    pub attempts: Vec<PassAttempt>,
    /// The selected attempt ran on the enhanced frame.
    pub enhanced: bool,
    pub upscale: f32,
    pub roi_applied: bool,
    pub errors: Vec<PipelineError>,
    /// Detectors excluded during this run.
    pub newly_unavailable: Vec<DetectorKind>,
}

/// Per-session pass selection. Holds no state across cycles.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    mode: DetectorMode,
    passes: PassConfig,
    /// `max(min_face_score, sensitivity)`.
    base_score: f32,
    preprocessor: Preprocessor,
}

struct WorkingFrame<'a> {
    frame: &'a Frame,
    mapping: FrameMapping,
    enhanced: bool,
}

impl Orchestrator {
    pub fn new(
        mode: DetectorMode,
        passes: PassConfig,
        min_face_score: f32,
        sensitivity: f32,
        preprocessor: Preprocessor,
    ) -> Self {
        Self {
            mode,
            passes,
            base_score: min_face_score.max(sensitivity),
            preprocessor,
        }
    }

    pub fn mode(&self) -> DetectorMode {
        self.mode
    }

    pub fn passes(&self) -> &PassConfig {
        &self.passes
    }

    pub fn standard_threshold(&self) -> f32 {
        (self.base_score - self.passes.score_margin).max(self.passes.absolute_min_score)
    }

    pub fn rescue_threshold(&self) -> f32 {
        (self.standard_threshold() - self.passes.rescue_threshold_drop)
            .max(self.passes.absolute_min_score)
    }

    /// Pass 3 threshold given the last threshold actually used.
    pub fn fallback_threshold(&self, previous: f32) -> f32 {
        previous
            .min(self.passes.fallback_floor)
            .max(self.passes.absolute_min_score)
    }

    fn standard_size(&self, kind: DetectorKind) -> u32 {
        match kind {
            DetectorKind::Tiny => self.passes.tiny_input_size,
            DetectorKind::Ssd => self.passes.ssd_input_size,
        }
    }

    fn rescue_allowed(&self) -> bool {
        self.passes.rescue_enabled && self.mode.permits_rescue()
    }

    /// Pass 1 detectors: the mode's kinds still loaded, else whatever remains.
    fn standard_kinds(&self, detectors: &DetectorSet) -> Vec<DetectorKind> {
        let kinds: Vec<DetectorKind> = self
            .mode
            .kinds()
            .iter()
            .copied()
            .filter(|k| detectors.is_available(*k))
            .collect();
        if kinds.is_empty() {
            detectors.available()
        } else {
            kinds
        }
    }

    /// Run the passes against `frame`, filtering each attempt in source pixels.
    pub async fn run(&self, detectors: &DetectorSet, filter: &FaceFilter, frame: &Frame) -> PassOutcome {
        let mut outcome = PassOutcome {
            upscale: 1.0,
            ..PassOutcome::default()
        };

        let roi_crop = match self.preprocessor.crop_roi(frame) {
            Ok(crop) => crop,
            Err(e) => {
                log::warn!("roi crop failed, using full frame: {:#}", e);
                outcome.errors.push(PipelineError::Inference(format!("roi crop: {:#}", e)));
                None
            }
        };
        outcome.roi_applied = roi_crop.is_some();
        let standard = match &roi_crop {
            Some((cropped, mapping)) => WorkingFrame {
                frame: cropped,
                mapping: *mapping,
                enhanced: false,
            },
            None => WorkingFrame {
                frame,
                mapping: FrameMapping::identity(),
                enhanced: false,
            },
        };

        let threshold = self.standard_threshold();
        for kind in self.standard_kinds(detectors) {
            let size = self.standard_size(kind);
            if self
                .attempt(&mut outcome, detectors, filter, frame, &standard, PASS_STANDARD, kind, size, threshold)
                .await
            {
                return outcome;
            }
        }
        let mut last_threshold = threshold;

        if self.rescue_allowed() {
            match self.preprocessor.enhance(frame) {
                Ok((enhanced, mapping)) => {
                    let working = WorkingFrame {
                        frame: &enhanced,
                        mapping,
                        enhanced: true,
                    };
                    let threshold = self.rescue_threshold();
                    last_threshold = threshold;
                    let plan = [
                        (DetectorKind::Ssd, self.passes.ssd_input_size),
                        (DetectorKind::Tiny, self.passes.rescue_input_size),
                    ];
                    for (kind, size) in plan {
                        if !detectors.is_available(kind) {
                            continue;
                        }
                        if self
                            .attempt(&mut outcome, detectors, filter, frame, &working, PASS_RESCUE, kind, size, threshold)
                            .await
                        {
                            outcome.upscale = self.preprocessor.upscale();
                            return outcome;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("rescue preprocessing failed: {:#}", e);
                    outcome
                        .errors
                        .push(PipelineError::Inference(format!("preprocessing: {:#}", e)));
                }
            }
        }

        if self.passes.fallback_enabled {
            let kind = if detectors.is_available(DetectorKind::Tiny) {
                Some(DetectorKind::Tiny)
            } else {
                detectors.available().first().copied()
            };
            if let Some(kind) = kind {
                let threshold = self.fallback_threshold(last_threshold);
                let size = self.passes.fallback_input_size;
                self.attempt(&mut outcome, detectors, filter, frame, &standard, PASS_FALLBACK, kind, size, threshold)
                    .await;
            }
        }

        outcome
    }

    /// One detector call. Returns true when detections survived the filter,
    /// in which case they are stored as the outcome's result.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        outcome: &mut PassOutcome,
        detectors: &DetectorSet,
        filter: &FaceFilter,
        source: &Frame,
        working: &WorkingFrame<'_>,
        pass: u8,
        kind: DetectorKind,
        input_size: u32,
        threshold: f32,
    ) -> bool {
        let Some(detector) = detectors.get(kind) else {
            return false;
        };
        outcome.pass = pass;
        outcome.detector = Some(kind);
        outcome.enhanced = working.enhanced;

        let raw = match detector.detect(working.frame, input_size, threshold).await {
            Ok(raw) => raw,
            Err(PipelineError::DetectorUnavailable(lost)) => {
                if detectors.exclude(lost) {
                    log::warn!("detector {} unavailable, excluded for this session", lost);
                    outcome.newly_unavailable.push(lost);
                }
                outcome.errors.push(PipelineError::DetectorUnavailable(lost));
                outcome.raw_count = 0;
                return false;
            }
            Err(e) => {
                log::warn!("pass {} {} detector failed: {}", pass, kind, e);
                outcome.errors.push(e);
                outcome.raw_count = 0;
                return false;
            }
        };

        let raw_count = raw.len();
        let mapped: Vec<RawDetection> = raw
            .into_iter()
            .map(|mut det| {
                det.bbox = working.mapping.to_source(&det.bbox);
                det
            })
            .collect();
        let filtered = filter.apply(mapped, source);
        let kept_count = filtered.kept.len();
        log::debug!(
            "pass {} {}@{} t={:.2}: raw={} kept={}",
            pass,
            kind,
            input_size,
            threshold,
            raw_count,
            kept_count
        );
        outcome.attempts.push(PassAttempt {
            pass,
            detector: kind,
            input_size,
            threshold,
            raw_count,
            kept_count,
        });
        outcome.raw_count = raw_count;
        if kept_count == 0 {
            return false;
        }
        outcome.detections = filtered.kept;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::detect::{FaceDetector, GenderSignal, ScriptedDetector, ScriptedFace};
    use crate::filter::{FilterBounds, TextureCheck};
    use crate::geometry::{BoundingBox, Roi};
    use crate::preprocess::PreprocessingOptions;

    fn face(score: f32) -> ScriptedFace {
        ScriptedFace::from_pixels(
            BoundingBox::new(270.0, 190.0, 100.0, 100.0),
            640,
            480,
            score,
            30.0,
            GenderSignal::Female(0.6),
        )
    }

    fn filter(min_score: f32, sensitivity: f32) -> FaceFilter {
        FaceFilter::new(
            FilterBounds {
                min_face_score: min_score,
                min_face_size_px: 20.0,
                min_face_size_percent: 0.1,
                max_face_size_percent: 35.0,
                aspect_ratio_min: 0.5,
                aspect_ratio_max: 1.8,
            },
            sensitivity,
            TextureCheck::disabled(),
        )
    }

    fn cctv_passes() -> PassConfig {
        PassConfig {
            rescue_enabled: true,
            fallback_enabled: true,
            ..PassConfig::default()
        }
    }

    fn orchestrator(mode: DetectorMode, passes: PassConfig, roi: Option<Roi>) -> Orchestrator {
        Orchestrator::new(
            mode,
            passes,
            0.3,
            0.4,
            Preprocessor::new(PreprocessingOptions::default(), 2.0, roi),
        )
    }

    fn set(detectors: Vec<Arc<ScriptedDetector>>) -> DetectorSet {
        DetectorSet::from_detectors(
            detectors
                .into_iter()
                .map(|d| d as Arc<dyn FaceDetector>)
                .collect(),
        )
        .unwrap()
    }

    fn frame() -> Frame {
        Frame::filled(640, 480, [90, 90, 90]).unwrap()
    }

    #[test]
    fn thresholds_step_down_and_respect_absolute_minimum() {
        let o = orchestrator(DetectorMode::Dual, cctv_passes(), None);
        assert!((o.standard_threshold() - 0.35).abs() < 1e-6);
        assert!((o.rescue_threshold() - 0.25).abs() < 1e-6);
        assert!((o.fallback_threshold(0.25) - 0.2).abs() < 1e-6);

        let low = Orchestrator::new(
            DetectorMode::Tiny,
            PassConfig {
                absolute_min_score: 0.25,
                ..cctv_passes()
            },
            0.2,
            0.2,
            Preprocessor::new(PreprocessingOptions::neutral(), 1.0, None),
        );
        assert_eq!(low.standard_threshold(), 0.25);
        assert_eq!(low.rescue_threshold(), 0.25);
        assert_eq!(low.fallback_threshold(0.25), 0.25);
    }

    #[test]
    fn input_sizes_follow_enabled_passes() {
        let webcam = PassConfig::default();
        assert_eq!(webcam.input_sizes(DetectorKind::Tiny), vec![416]);
        assert_eq!(webcam.input_sizes(DetectorKind::Ssd), vec![512]);

        let cctv = cctv_passes();
        assert_eq!(cctv.input_sizes(DetectorKind::Tiny), vec![320, 416, 608]);
        assert_eq!(cctv.input_sizes(DetectorKind::Ssd), vec![320, 512]);
    }

    #[tokio::test]
    async fn every_attempt_runs_at_a_warmed_input_size() {
        let passes = cctv_passes();
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny));
        let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd));

        let outcome = orchestrator(DetectorMode::Dual, passes, None)
            .run(&set(vec![tiny, ssd]), &filter(0.3, 0.4), &frame())
            .await;
        assert_eq!(outcome.pass, PASS_FALLBACK);
        for attempt in &outcome.attempts {
            assert!(
                passes.input_sizes(attempt.detector).contains(&attempt.input_size),
                "{:?}",
                attempt
            );
        }

        let ssd_only = Arc::new(ScriptedDetector::new(DetectorKind::Ssd));
        let outcome = orchestrator(DetectorMode::Dual, passes, None)
            .run(&set(vec![ssd_only]), &filter(0.3, 0.4), &frame())
            .await;
        assert_eq!(outcome.detector, Some(DetectorKind::Ssd));
        for attempt in &outcome.attempts {
            assert!(passes.input_sizes(attempt.detector).contains(&attempt.input_size));
        }
    }

    #[tokio::test]
    async fn standard_pass_wins_when_it_finds_faces() {
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny).with_faces(vec![face(0.9)]));
        let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd).with_faces(vec![face(0.9)]));
        let detectors = set(vec![tiny.clone(), ssd.clone()]);

        let outcome = orchestrator(DetectorMode::Dual, cctv_passes(), None)
            .run(&detectors, &filter(0.3, 0.4), &frame())
            .await;
        assert_eq!(outcome.pass, PASS_STANDARD);
        assert_eq!(outcome.detector, Some(DetectorKind::Tiny));
        assert_eq!(outcome.detections.len(), 1);
        assert_eq!(outcome.detections[0].bbox, BoundingBox::new(270.0, 190.0, 100.0, 100.0));
        assert_eq!(tiny.calls(), 1);
        assert_eq!(ssd.calls(), 0);
    }

    #[tokio::test]
    async fn rescue_pass_recovers_weak_face_on_upscaled_frame() {
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny).with_faces(vec![face(0.32)]));
        let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd).with_faces(vec![face(0.32)]));
        let detectors = set(vec![tiny.clone(), ssd.clone()]);

        let outcome = orchestrator(DetectorMode::Dual, cctv_passes(), None)
            .run(&detectors, &filter(0.3, 0.4), &frame())
            .await;
        assert_eq!(outcome.pass, PASS_RESCUE);
        assert_eq!(outcome.detector, Some(DetectorKind::Ssd));
        assert!(outcome.enhanced);
        assert_eq!(outcome.upscale, 2.0);
        // Mapped back from the 2x working frame.
        let bbox = outcome.detections[0].bbox;
        assert!((bbox.x - 270.0).abs() < 1e-3 && (bbox.width - 100.0).abs() < 1e-3);
        let passes: Vec<u8> = outcome.attempts.iter().map(|a| a.pass).collect();
        assert_eq!(passes, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn tiny_mode_skips_rescue_and_goes_to_fallback() {
        let tiny = Arc::new(
            ScriptedDetector::new(DetectorKind::Tiny)
                .with_sequence(vec![vec![], vec![face(0.22)]]),
        );
        let detectors = set(vec![tiny.clone()]);

        let outcome = orchestrator(DetectorMode::Tiny, cctv_passes(), None)
            .run(&detectors, &filter(0.2, 0.2), &frame())
            .await;
        assert_eq!(outcome.pass, PASS_FALLBACK);
        assert_eq!(outcome.attempts[1].input_size, 320);
        assert!((outcome.attempts[1].threshold - 0.2).abs() < 1e-6);
        assert_eq!(outcome.detections.len(), 1);
        assert!(!outcome.enhanced);
    }

    #[tokio::test]
    async fn webcam_session_runs_a_single_pass() {
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny));
        let detectors = set(vec![tiny.clone()]);

        let outcome = orchestrator(DetectorMode::Tiny, PassConfig::default(), None)
            .run(&detectors, &filter(0.5, 0.5), &frame())
            .await;
        assert_eq!(outcome.pass, PASS_STANDARD);
        assert!(outcome.detections.is_empty());
        assert_eq!(tiny.calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_detector_is_excluded_once_and_fallen_back_from() {
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny).unavailable());
        let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd).with_faces(vec![face(0.9)]));
        let detectors = set(vec![tiny, ssd]);
        let o = orchestrator(DetectorMode::Dual, cctv_passes(), None);

        let first = o.run(&detectors, &filter(0.3, 0.4), &frame()).await;
        assert_eq!(first.newly_unavailable, vec![DetectorKind::Tiny]);
        assert_eq!(first.detector, Some(DetectorKind::Ssd));
        assert_eq!(first.detections.len(), 1);

        let second = o.run(&detectors, &filter(0.3, 0.4), &frame()).await;
        assert!(second.newly_unavailable.is_empty());
        assert!(second.errors.is_empty());
        assert_eq!(detectors.available(), vec![DetectorKind::Ssd]);
    }

    #[tokio::test]
    async fn tiny_mode_falls_back_to_remaining_detector() {
        let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd).with_faces(vec![face(0.9)]));
        let detectors = set(vec![ssd]);

        let outcome = orchestrator(DetectorMode::Tiny, PassConfig::default(), None)
            .run(&detectors, &filter(0.3, 0.4), &frame())
            .await;
        assert_eq!(outcome.detector, Some(DetectorKind::Ssd));
        assert_eq!(outcome.attempts[0].input_size, 512);
    }

    #[tokio::test]
    async fn roi_detections_are_offset_into_source_frame() {
        // Face at the ROI's top-left quarter; ROI is the right half of the frame.
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny).with_faces(vec![ScriptedFace::new(
            BoundingBox::new(0.25, 0.25, 0.25, 0.25),
            0.9,
            30.0,
            GenderSignal::Unknown,
        )]));
        let detectors = set(vec![tiny]);
        let roi = Roi {
            x: 0.5,
            y: 0.0,
            width: 0.5,
            height: 1.0,
        };

        let outcome = orchestrator(DetectorMode::Tiny, PassConfig::default(), Some(roi))
            .run(&detectors, &filter(0.3, 0.4), &frame())
            .await;
        assert!(outcome.roi_applied);
        assert_eq!(outcome.detections[0].bbox, BoundingBox::new(400.0, 120.0, 80.0, 120.0));
    }

    #[tokio::test]
    async fn filtered_out_pass_does_not_count_as_success() {
        // 40% of the frame: rejected by the size filter in every pass.
        let huge = ScriptedFace::new(
            BoundingBox::new(0.1, 0.1, 0.632, 0.632),
            0.95,
            30.0,
            GenderSignal::Unknown,
        );
        let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny).with_faces(vec![huge]));
        let detectors = set(vec![tiny.clone()]);

        let outcome = orchestrator(DetectorMode::Tiny, cctv_passes(), None)
            .run(&detectors, &filter(0.3, 0.4), &frame())
            .await;
        assert!(outcome.detections.is_empty());
        assert_eq!(outcome.pass, PASS_FALLBACK);
        assert_eq!(outcome.raw_count, 1);
        assert_eq!(tiny.calls(), 2);
    }
}
