use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::frame::Frame;

use super::result::RawDetection;

/// Underlying detector variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Fast, lightweight detector for few-face scenes.
    Tiny,
    /// Slower, higher-recall detector for small or many faces.
    Ssd,
}

impl DetectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorKind::Tiny => "tiny",
            DetectorKind::Ssd => "ssd",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which detectors a session runs in its standard pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorMode {
    Tiny,
    Ssd,
    Dual,
}

impl DetectorMode {
    /// Standard-pass detectors in the order they are tried.
    pub fn kinds(self) -> &'static [DetectorKind] {
        match self {
            DetectorMode::Tiny => &[DetectorKind::Tiny],
            DetectorMode::Ssd => &[DetectorKind::Ssd],
            DetectorMode::Dual => &[DetectorKind::Tiny, DetectorKind::Ssd],
        }
    }

    /// Tiny-only sessions never run the rescue pass.
    pub fn permits_rescue(self) -> bool {
        !matches!(self, DetectorMode::Tiny)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tiny" => Some(DetectorMode::Tiny),
            "ssd" => Some(DetectorMode::Ssd),
            "dual" => Some(DetectorMode::Dual),
            _ => None,
        }
    }
}

/// Face detector adapter.
///
/// Every implementation produces the same normalized `RawDetection`, with boxes in
/// the pixel space of the frame it was handed. `input_size` is the detector's
/// internal resize target, not the frame size.
///
/// Implementations must treat the frame as read-only and must not retain pixels
/// past the call.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Backend identifier for diagnostics.
    fn backend_name(&self) -> &'static str;

    /// Run detection. Returns `DetectorUnavailable` when weights are not loaded.
    async fn detect(
        &self,
        frame: &Frame,
        input_size: u32,
        score_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError>;

    /// Optional warm-up hook, awaited once after loading.
    async fn warm_up(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}
