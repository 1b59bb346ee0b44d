use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};

use super::backend::{DetectorKind, FaceDetector};

struct DetectorSlot {
    kind: DetectorKind,
    detector: Arc<dyn FaceDetector>,
    excluded: AtomicBool,
}

/// Capability set of loaded detectors for one session.
///
/// Built once from an awaited initialization per detector. Detectors that failed
/// to load are never present; detectors that report `DetectorUnavailable` later
/// are excluded for the rest of the session.
pub struct DetectorSet {
    slots: Vec<DetectorSlot>,
    failed: Vec<(DetectorKind, String)>,
}

impl DetectorSet {
    /// Await `load` once per requested kind and keep the ones that succeed.
    ///
    /// Fails with `NoUsableDetector` when nothing loads.
    pub async fn initialize<F, Fut>(kinds: &[DetectorKind], load: F) -> PipelineResult<Self>
    where
        F: Fn(DetectorKind) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn FaceDetector>>>,
    {
        let mut detectors = Vec::new();
        let mut failed = Vec::new();
        for &kind in kinds {
            match load(kind).await {
                Ok(detector) => match detector.warm_up().await {
                    Ok(()) => {
                        log::info!(
                            "detector {} loaded ({} backend)",
                            kind,
                            detector.backend_name()
                        );
                        detectors.push(detector);
                    }
                    Err(e) => {
                        log::warn!("detector {} failed warm-up: {}", kind, e);
                        failed.push((kind, e.to_string()));
                    }
                },
                Err(e) => {
                    log::warn!("detector {} unavailable: {:#}", kind, e);
                    failed.push((kind, format!("{:#}", e)));
                }
            }
        }
        let mut set = Self::from_detectors(detectors)?;
        set.failed = failed;
        Ok(set)
    }

    /// Build from already-loaded detectors. Later duplicates of a kind are ignored.
    pub fn from_detectors(detectors: Vec<Arc<dyn FaceDetector>>) -> PipelineResult<Self> {
        let mut slots: Vec<DetectorSlot> = Vec::new();
        for detector in detectors {
            let kind = detector.kind();
            if slots.iter().any(|s| s.kind == kind) {
                log::warn!("duplicate {} detector ignored", kind);
                continue;
            }
            slots.push(DetectorSlot {
                kind,
                detector,
                excluded: AtomicBool::new(false),
            });
        }
        if slots.is_empty() {
            return Err(PipelineError::NoUsableDetector);
        }
        Ok(Self {
            slots,
            failed: Vec::new(),
        })
    }

    /// Loaded, non-excluded detector of the given kind.
    pub fn get(&self, kind: DetectorKind) -> Option<Arc<dyn FaceDetector>> {
        self.slots
            .iter()
            .find(|s| s.kind == kind && !s.excluded.load(Ordering::Acquire))
            .map(|s| s.detector.clone())
    }

    pub fn is_available(&self, kind: DetectorKind) -> bool {
        self.get(kind).is_some()
    }

    /// Exclude a detector for the remainder of the session.
    ///
    /// Returns true only the first time, so callers report the loss once.
    pub fn exclude(&self, kind: DetectorKind) -> bool {
        match self.slots.iter().find(|s| s.kind == kind) {
            Some(slot) => !slot.excluded.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    pub fn available(&self) -> Vec<DetectorKind> {
        self.slots
            .iter()
            .filter(|s| !s.excluded.load(Ordering::Acquire))
            .map(|s| s.kind)
            .collect()
    }

    /// Detectors that failed to load or were excluded.
    pub fn unavailable(&self) -> Vec<DetectorKind> {
        let mut kinds: Vec<DetectorKind> = self.failed.iter().map(|(k, _)| *k).collect();
        for slot in &self.slots {
            if slot.excluded.load(Ordering::Acquire) && !kinds.contains(&slot.kind) {
                kinds.push(slot.kind);
            }
        }
        kinds
    }

    /// Load failures with their reasons.
    pub fn load_failures(&self) -> &[(DetectorKind, String)] {
        &self.failed
    }

    pub fn has_any(&self) -> bool {
        self.slots
            .iter()
            .any(|s| !s.excluded.load(Ordering::Acquire))
    }

    /// Backend name of the first available detector.
    pub fn backend_name(&self) -> &'static str {
        self.slots
            .iter()
            .find(|s| !s.excluded.load(Ordering::Acquire))
            .map(|s| s.detector.backend_name())
            .unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedDetector;
    use anyhow::anyhow;

    #[tokio::test]
    async fn initialize_keeps_loaded_detectors_only() {
        let set = DetectorSet::initialize(&[DetectorKind::Tiny, DetectorKind::Ssd], |kind| async move {
            match kind {
                DetectorKind::Tiny => {
                    Ok(Arc::new(ScriptedDetector::new(kind)) as Arc<dyn FaceDetector>)
                }
                DetectorKind::Ssd => Err(anyhow!("weights missing")),
            }
        })
        .await
        .unwrap();

        assert_eq!(set.available(), vec![DetectorKind::Tiny]);
        assert_eq!(set.unavailable(), vec![DetectorKind::Ssd]);
        assert!(set.load_failures()[0].1.contains("weights missing"));
    }

    #[tokio::test]
    async fn initialize_fails_when_nothing_loads() {
        let result = DetectorSet::initialize(&[DetectorKind::Tiny], |_| async {
            Err::<Arc<dyn FaceDetector>, _>(anyhow!("no weights"))
        })
        .await;
        assert_eq!(result.err(), Some(PipelineError::NoUsableDetector));
    }

    #[test]
    fn exclusion_reports_once() {
        let set = DetectorSet::from_detectors(vec![
            Arc::new(ScriptedDetector::new(DetectorKind::Tiny)),
            Arc::new(ScriptedDetector::new(DetectorKind::Ssd)),
        ])
        .unwrap();

        assert!(set.exclude(DetectorKind::Ssd));
        assert!(!set.exclude(DetectorKind::Ssd));
        assert!(!set.is_available(DetectorKind::Ssd));
        assert!(set.has_any());
        assert_eq!(set.unavailable(), vec![DetectorKind::Ssd]);

        set.exclude(DetectorKind::Tiny);
        assert!(!set.has_any());
        assert_eq!(set.backend_name(), "none");
    }
}
