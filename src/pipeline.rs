//! One detection cycle, end to end.
//!
//! Readiness check, frame grab, multi-pass detection under a hard timeout,
//! classification, tracker update, snapshot. At most one cycle runs per pipeline
//! at a time; a cycle that finds another in flight is a no-op. Per-cycle errors
//! stay inside the returned `CycleReport`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::classify::{DemographicClassifier, FilteredDetection};
use crate::config::DetectionConfig;
use crate::detect::{DetectorKind, DetectorSet, FaceDetector};
use crate::error::{PipelineError, PipelineResult};
use crate::filter::FaceFilter;
use crate::ingest::FrameSource;
use crate::orchestrator::{Orchestrator, PassAttempt, PassOutcome};
use crate::preprocess::Preprocessor;
use crate::session::{confirmed_results, current_snapshot, DemographicCounts, DetectionResult};
use crate::tracker::{FaceTracker, TrackUpdate};

const FPS_SMOOTHING: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another cycle was still running.
    InFlight,
    SourceNotReady,
    /// No usable detector remains.
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum CycleOutcome {
    Completed,
    /// Abandoned at the time budget and treated as zero detections.
    TimedOut,
    Skipped(SkipReason),
}

/// Per-cycle diagnostics. Telemetry only; nothing reads it for control.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DebugInfo {
    pub fps: f32,
    pub latency_ms: u64,
    pub backend: String,
    /// `0` when no pass ran.
    pub pass_used: u8,
    pub detector_used: Option<DetectorKind>,
    pub raw_count: usize,
    pub filtered_count: usize,
    pub track_count: usize,
    pub confirmed_count: usize,
    pub preprocessing_applied: bool,
    pub upscale: f32,
    pub roi_applied: bool,
    pub frame_width: u32,
    pub frame_height: u32,
    pub unavailable_detectors: Vec<DetectorKind>,
    pub attempts: Vec<PassAttempt>,
    pub error: Option<String>,
}

/// Everything one cycle produced.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub results: Vec<DetectionResult>,
    pub snapshot: DemographicCounts,
    pub debug: DebugInfo,
    #[serde(skip)]
    pub error: Option<PipelineError>,
    #[serde(skip)]
    pub track_update: TrackUpdate,
}

impl CycleReport {
    pub fn ran(&self) -> bool {
        !matches!(self.outcome, CycleOutcome::Skipped(_))
    }
}

/// Receives every cycle report, e.g. an evaluation/labeling surface.
pub trait CycleObserver: Send + Sync {
    fn on_cycle(&self, report: &CycleReport);
}

#[derive(Default)]
struct Telemetry {
    last_start: Option<Instant>,
    fps: f32,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Explicitly owned session context for one video source.
pub struct DetectionPipeline {
    config: DetectionConfig,
    detectors: DetectorSet,
    orchestrator: Orchestrator,
    filter: FaceFilter,
    classifier: DemographicClassifier,
    tracker: Mutex<FaceTracker>,
    in_flight: AtomicBool,
    disabled: AtomicBool,
    telemetry: Mutex<Telemetry>,
    observers: Vec<Arc<dyn CycleObserver>>,
}

impl DetectionPipeline {
    pub fn new(config: DetectionConfig, detectors: DetectorSet) -> Self {
        let orchestrator = Orchestrator::new(
            config.detector_mode,
            config.passes,
            config.filter.min_face_score,
            config.sensitivity,
            Preprocessor::new(config.preprocessing, config.upscale, config.roi),
        );
        let filter = FaceFilter::new(config.filter, config.sensitivity, config.texture);
        let classifier = DemographicClassifier::new(config.bias);
        let tracker = FaceTracker::new(config.tracking);
        let disabled = !detectors.has_any();
        log::info!(
            "pipeline ready: {:?} preset, {:?} mode, detectors {:?}",
            config.preset,
            config.detector_mode,
            detectors.available()
        );
        Self {
            config,
            detectors,
            orchestrator,
            filter,
            classifier,
            tracker: Mutex::new(tracker),
            in_flight: AtomicBool::new(false),
            disabled: AtomicBool::new(disabled),
            telemetry: Mutex::new(Telemetry::default()),
            observers: Vec::new(),
        }
    }

    /// Load the detectors the configured mode needs, awaiting each once.
    pub async fn initialize<F, Fut>(config: DetectionConfig, load: F) -> PipelineResult<Self>
    where
        F: Fn(DetectorKind) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn FaceDetector>>>,
    {
        let detectors = DetectorSet::initialize(config.detector_mode.kinds(), load).await?;
        Ok(Self::new(config, detectors))
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn detectors(&self) -> &DetectorSet {
        &self.detectors
    }

    /// Detection is permanently off for this session.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Current snapshot without running a cycle.
    pub fn snapshot(&self) -> DemographicCounts {
        self.tracker.lock().map(|t| current_snapshot(&t)).unwrap_or_default()
    }

    /// Drop all tracks and telemetry, e.g. on source switch.
    pub fn reset(&self) {
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.reset();
        }
        if let Ok(mut telemetry) = self.telemetry.lock() {
            *telemetry = Telemetry::default();
        }
        log::info!("pipeline reset");
    }

    /// Run one detection cycle against `source`. Never fails; see `CycleReport`.
    pub async fn run_cycle(&self, source: &mut dyn FrameSource) -> CycleReport {
        if self.is_disabled() {
            return self.skipped(SkipReason::Disabled, Some(PipelineError::NoUsableDetector));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("cycle skipped: previous cycle still in flight");
            return self.skipped(SkipReason::InFlight, None);
        }
        let _guard = InFlightGuard(&self.in_flight);

        if !source.is_ready() {
            return self.skipped(SkipReason::SourceNotReady, Some(PipelineError::VideoSourceNotReady));
        }
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("{}: no frame: {:#}", source.name(), e);
                return self.skipped(SkipReason::SourceNotReady, Some(PipelineError::VideoSourceNotReady));
            }
        };

        let started = Instant::now();
        let fps = self.tick_fps(started);

        let timeout = self.config.cycle_timeout;
        let (outcome, passes, mut error) =
            match tokio::time::timeout(timeout, self.orchestrator.run(&self.detectors, &self.filter, &frame)).await {
                Ok(passes) => (CycleOutcome::Completed, passes, None),
                Err(_) => {
                    log::warn!("detection cycle abandoned after {}ms", timeout.as_millis());
                    (
                        CycleOutcome::TimedOut,
                        PassOutcome {
                            upscale: 1.0,
                            ..PassOutcome::default()
                        },
                        Some(PipelineError::DetectionTimeout(timeout)),
                    )
                }
            };

        let detector = passes.detector.unwrap_or(DetectorKind::Tiny);
        let filtered: Vec<FilteredDetection> = passes
            .detections
            .iter()
            .map(|det| self.classifier.classify_detection(det, detector, Some(&frame)))
            .collect();

        let (track_update, results, snapshot, track_count) = match self.tracker.lock() {
            Ok(mut tracker) => {
                let update = tracker.update(&filtered, frame.captured_at_ms());
                (update, confirmed_results(&tracker), current_snapshot(&tracker), tracker.len())
            }
            Err(_) => {
                log::error!("tracker lock poisoned; cycle dropped");
                (TrackUpdate::default(), Vec::new(), DemographicCounts::default(), 0)
            }
        };

        if !self.detectors.has_any() {
            self.disabled.store(true, Ordering::Release);
            log::error!("no usable face detector remains; detection disabled for this session");
            error = Some(PipelineError::NoUsableDetector);
        } else if error.is_none() {
            error = passes.errors.last().cloned();
        }

        let debug = DebugInfo {
            fps,
            latency_ms: started.elapsed().as_millis() as u64,
            backend: self.detectors.backend_name().to_string(),
            pass_used: passes.pass,
            detector_used: passes.detector,
            raw_count: passes.raw_count,
            filtered_count: filtered.len(),
            track_count,
            confirmed_count: results.len(),
            preprocessing_applied: passes.enhanced,
            upscale: passes.upscale,
            roi_applied: passes.roi_applied,
            frame_width: frame.width(),
            frame_height: frame.height(),
            unavailable_detectors: self.detectors.unavailable(),
            attempts: passes.attempts,
            error: error.as_ref().map(|e| e.to_string()),
        };
        drop(frame);

        log::log!(
            if self.config.debug { log::Level::Info } else { log::Level::Debug },
            "cycle: pass={} raw={} kept={} tracks={} confirmed={} {}ms",
            debug.pass_used,
            debug.raw_count,
            debug.filtered_count,
            debug.track_count,
            debug.confirmed_count,
            debug.latency_ms
        );

        let report = CycleReport {
            outcome,
            results,
            snapshot,
            debug,
            error,
            track_update,
        };
        self.notify(&report);
        report
    }

    fn skipped(&self, reason: SkipReason, error: Option<PipelineError>) -> CycleReport {
        let (results, snapshot, track_count) = match self.tracker.lock() {
            Ok(tracker) => (confirmed_results(&tracker), current_snapshot(&tracker), tracker.len()),
            Err(_) => (Vec::new(), DemographicCounts::default(), 0),
        };
        let fps = self.telemetry.lock().map(|t| t.fps).unwrap_or(0.0);
        let report = CycleReport {
            outcome: CycleOutcome::Skipped(reason),
            debug: DebugInfo {
                fps,
                backend: self.detectors.backend_name().to_string(),
                upscale: 1.0,
                track_count,
                confirmed_count: results.len(),
                unavailable_detectors: self.detectors.unavailable(),
                error: error.as_ref().map(|e| e.to_string()),
                ..DebugInfo::default()
            },
            results,
            snapshot,
            error,
            track_update: TrackUpdate::default(),
        };
        if reason != SkipReason::InFlight {
            self.notify(&report);
        }
        report
    }

    fn tick_fps(&self, now: Instant) -> f32 {
        let Ok(mut telemetry) = self.telemetry.lock() else {
            return 0.0;
        };
        if let Some(last) = telemetry.last_start {
            let secs = now.duration_since(last).as_secs_f32();
            if secs > 0.0 {
                let instant = 1.0 / secs;
                telemetry.fps = if telemetry.fps == 0.0 {
                    instant
                } else {
                    FPS_SMOOTHING * instant + (1.0 - FPS_SMOOTHING) * telemetry.fps
                };
            }
        }
        telemetry.last_start = Some(now);
        telemetry.fps
    }

    fn notify(&self, report: &CycleReport) {
        for observer in &self.observers {
            observer.on_cycle(report);
        }
    }
}
