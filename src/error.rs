//! Error taxonomy for detection cycles.
//!
//! Per-cycle errors are contained inside the cycle that produced them and end up
//! in the `CycleReport`. Only `NoUsableDetector` changes session state.

use std::time::Duration;

use thiserror::Error;

use crate::detect::DetectorKind;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// A detector's weights are not loaded. The detector is excluded for the session.
    #[error("detector {0} unavailable")]
    DetectorUnavailable(DetectorKind),

    /// The cycle exceeded its time budget and was abandoned.
    #[error("detection cycle timed out after {}ms", .0.as_millis())]
    DetectionTimeout(Duration),

    /// The frame source is not decodable yet. The cycle is skipped.
    #[error("video source not ready")]
    VideoSourceNotReady,

    /// No detector loaded; detection is disabled for the session.
    #[error("no usable face detector loaded")]
    NoUsableDetector,

    /// A loaded detector failed during inference.
    #[error("inference failed: {0}")]
    Inference(String),
}

impl PipelineError {
    /// True for errors that disable detection for the remainder of the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::NoUsableDetector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_total_unavailability_is_fatal() {
        assert!(PipelineError::NoUsableDetector.is_fatal());
        assert!(!PipelineError::VideoSourceNotReady.is_fatal());
        assert!(!PipelineError::DetectionTimeout(Duration::from_secs(10)).is_fatal());
        assert!(!PipelineError::DetectorUnavailable(DetectorKind::Ssd).is_fatal());
    }

    #[test]
    fn timeout_message_reports_millis() {
        let err = PipelineError::DetectionTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "detection cycle timed out after 1500ms");
    }
}
