use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::detect::backend::{DetectorKind, FaceDetector};
use crate::detect::result::{GenderSignal, RawDetection};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// One face the scripted detector reports.
///
/// The box is normalized to the frame the detector is handed, so the same
/// script lands in the right place on upscaled working frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScriptedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub age: f32,
    pub gender: GenderSignal,
}

impl ScriptedFace {
    pub fn new(bbox: BoundingBox, score: f32, age: f32, gender: GenderSignal) -> Self {
        Self {
            bbox,
            score,
            age,
            gender,
        }
    }

    /// Build from a pixel box on a frame of `frame_width x frame_height`.
    pub fn from_pixels(
        bbox: BoundingBox,
        frame_width: u32,
        frame_height: u32,
        score: f32,
        age: f32,
        gender: GenderSignal,
    ) -> Self {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        Self::new(
            BoundingBox::new(bbox.x / fw, bbox.y / fh, bbox.width / fw, bbox.height / fh),
            score,
            age,
            gender,
        )
    }

    fn to_detection(self, frame: &Frame) -> RawDetection {
        let fw = frame.width() as f32;
        let fh = frame.height() as f32;
        RawDetection::new(
            BoundingBox::new(
                self.bbox.x * fw,
                self.bbox.y * fh,
                self.bbox.width * fw,
                self.bbox.height * fh,
            ),
            self.score,
            self.age,
            self.gender,
        )
    }
}

enum Script {
    Constant(Vec<ScriptedFace>),
    /// One entry per call; empty once exhausted.
    Sequence(VecDeque<Vec<ScriptedFace>>),
}

/// Deterministic detector that replays a script.
///
/// Used by tests, by the `demo` binary and for replaying annotated captures.
/// Honors the score threshold like a real detector and can simulate latency,
/// input-size sensitivity and missing weights.
pub struct ScriptedDetector {
    kind: DetectorKind,
    script: Mutex<Script>,
    latency: Duration,
    first_call_latency: Option<Duration>,
    min_input_size: u32,
    unavailable: AtomicBool,
    calls: AtomicUsize,
    in_progress: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(kind: DetectorKind) -> Self {
        Self {
            kind,
            script: Mutex::new(Script::Constant(Vec::new())),
            latency: Duration::ZERO,
            first_call_latency: None,
            min_input_size: 0,
            unavailable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            in_progress: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Report the same faces on every call.
    pub fn with_faces(self, faces: Vec<ScriptedFace>) -> Self {
        self.replace_script(Script::Constant(faces));
        self
    }

    /// Report one entry per call, then nothing.
    pub fn with_sequence(self, frames: Vec<Vec<ScriptedFace>>) -> Self {
        self.replace_script(Script::Sequence(frames.into()));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Latency for the first call only, e.g. to provoke one timeout.
    pub fn with_first_call_latency(mut self, latency: Duration) -> Self {
        self.first_call_latency = Some(latency);
        self
    }

    /// Only find faces when run at or above this input size.
    pub fn with_min_input_size(mut self, size: u32) -> Self {
        self.min_input_size = size;
        self
    }

    /// Simulate weights that failed to load.
    pub fn unavailable(self) -> Self {
        self.unavailable.store(true, Ordering::Release);
        self
    }

    pub fn set_faces(&self, faces: Vec<ScriptedFace>) {
        self.replace_script(Script::Constant(faces));
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Highest number of overlapping `detect` calls observed.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent.load(Ordering::Acquire)
    }

    fn replace_script(&self, script: Script) {
        if let Ok(mut guard) = self.script.lock() {
            *guard = script;
        }
    }

    fn next_faces(&self) -> Vec<ScriptedFace> {
        let Ok(mut guard) = self.script.lock() else {
            return Vec::new();
        };
        match &mut *guard {
            Script::Constant(faces) => faces.clone(),
            Script::Sequence(frames) => frames.pop_front().unwrap_or_default(),
        }
    }
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn detect(
        &self,
        frame: &Frame,
        input_size: u32,
        score_threshold: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(PipelineError::DetectorUnavailable(self.kind));
        }

        let call = self.calls.fetch_add(1, Ordering::AcqRel);
        let concurrent = self.in_progress.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = CallGuard(&self.in_progress);
        self.max_concurrent.fetch_max(concurrent, Ordering::AcqRel);

        let latency = match self.first_call_latency {
            Some(first) if call == 0 => first,
            _ => self.latency,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let faces = self.next_faces();
        if input_size < self.min_input_size {
            return Ok(Vec::new());
        }
        Ok(faces
            .into_iter()
            .filter(|face| face.score >= score_threshold)
            .map(|face| face.to_detection(frame))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(score: f32) -> ScriptedFace {
        ScriptedFace::new(
            BoundingBox::new(0.25, 0.25, 0.5, 0.5),
            score,
            30.0,
            GenderSignal::Female(0.7),
        )
    }

    #[tokio::test]
    async fn scales_boxes_to_frame_and_honors_threshold() {
        let detector = ScriptedDetector::new(DetectorKind::Tiny).with_faces(vec![face(0.9), face(0.2)]);
        let frame = Frame::filled(200, 100, [0, 0, 0]).unwrap();

        let dets = detector.detect(&frame, 416, 0.5).await.unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(50.0, 25.0, 100.0, 50.0));
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn sequence_is_consumed_per_call() {
        let detector = ScriptedDetector::new(DetectorKind::Ssd)
            .with_sequence(vec![vec![face(0.9)], vec![]]);
        let frame = Frame::filled(10, 10, [0, 0, 0]).unwrap();

        assert_eq!(detector.detect(&frame, 512, 0.1).await.unwrap().len(), 1);
        assert!(detector.detect(&frame, 512, 0.1).await.unwrap().is_empty());
        assert!(detector.detect(&frame, 512, 0.1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_detector_reports_its_kind() {
        let detector = ScriptedDetector::new(DetectorKind::Ssd).unavailable();
        let frame = Frame::filled(10, 10, [0, 0, 0]).unwrap();
        assert_eq!(
            detector.detect(&frame, 512, 0.1).await,
            Err(PipelineError::DetectorUnavailable(DetectorKind::Ssd))
        );
        assert_eq!(detector.calls(), 0);
    }

    #[tokio::test]
    async fn min_input_size_gates_results() {
        let detector = ScriptedDetector::new(DetectorKind::Tiny)
            .with_faces(vec![face(0.9)])
            .with_min_input_size(608);
        let frame = Frame::filled(10, 10, [0, 0, 0]).unwrap();
        assert!(detector.detect(&frame, 416, 0.1).await.unwrap().is_empty());
        assert_eq!(detector.detect(&frame, 608, 0.1).await.unwrap().len(), 1);
    }
}
