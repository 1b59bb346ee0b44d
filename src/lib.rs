//! Audience Kernel
//!
//! This crate implements the detection core of an audience-aware ad player: it
//! finds faces in live video, estimates an age bracket and gender for each,
//! stabilizes those noisy per-frame estimates into per-person tracks and hands a
//! demographic snapshot to the ad queue.
//!
//! # Architecture
//!
//! raw frame -> preprocess (conditionally) -> detect (multi-pass) -> filter ->
//! classify -> track -> snapshot -> ad-queue consumer
//!
//! The kernel holds these properties by construction:
//!
//! 1. **Transient Frames**: frames live for one cycle, are never persisted and are
//!    zeroized on drop.
//! 2. **No Recognition**: tracks are per-session identity hypotheses; ids are
//!    never linked across sessions.
//! 3. **One Cycle In Flight**: a cycle that finds another running is a no-op, and
//!    every cycle is bounded by a hard timeout.
//! 4. **Contained Errors**: per-cycle failures end up in the cycle report; only the
//!    loss of every detector changes session state.
//!
//! # Module Structure
//!
//! - `frame`, `geometry`: pixel container and box math
//! - `preprocess`: enhancement for rescue passes, declarative quality presets
//! - `detect`: detector trait, capability set, backends
//! - `orchestrator`: pass 1 / 2 / 3 selection
//! - `filter`, `classify`: false-positive guard, demographic post-processing
//! - `tracker`, `session`: temporal tracking, demographic snapshot
//! - `pipeline`, `scheduler`: one cycle end to end, capture windows
//! - `ingest`: frame sources
//! - `config`: presets, file and environment loading

pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod filter;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod orchestrator;
pub mod pipeline;
pub mod preprocess;
pub mod scheduler;
pub mod session;
pub mod tracker;

pub use classify::{AgeGroup, BiasCorrection, Classification, DemographicClassifier, FilteredDetection, Gender};
pub use config::{DetectionConfig, SourcePreset, SourceSettings};
pub use detect::{
    DetectorKind, DetectorMode, DetectorSet, FaceDetector, GenderSignal, RawDetection, ScriptedDetector,
    ScriptedFace,
};
pub use error::{PipelineError, PipelineResult};
pub use filter::{FaceFilter, FilterBounds, Rejection, TextureCheck};
pub use frame::{Frame, FrameMapping};
pub use geometry::{BoundingBox, Roi};
pub use ingest::{open_source, FrameSource, ImageSequenceSource, PushHandle, PushSource, SyntheticSource};
pub use orchestrator::{Orchestrator, PassConfig, PassOutcome};
pub use pipeline::{CycleObserver, CycleOutcome, CycleReport, DebugInfo, DetectionPipeline, SkipReason};
pub use preprocess::{PreprocessingOptions, Preprocessor, QualityPreset};
pub use scheduler::{run_capture_window, switch_source, AdQueueConsumer, CaptureSchedule, CaptureWindow, WindowSummary};
pub use session::{DemographicCounts, DetectionResult};
pub use tracker::{FaceTracker, TrackState, TrackedFace, TrackingConfig};

#[cfg(feature = "backend-tract")]
pub use detect::{GenderColumn, TractDetector, TractModelSpec};
