//! Periodic detection cycles inside capture windows.
//!
//! A capture window is the stretch of ad playback during which the source is
//! sampled. The source is acquired when the window opens and released when it
//! closes, however it closes. Late timer ticks are dropped, never queued.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ingest::FrameSource;
use crate::pipeline::{CycleOutcome, CycleReport, DetectionPipeline};
use crate::session::DemographicCounts;

/// Ad-queue side of the boundary. Scoring and reordering live behind it.
pub trait AdQueueConsumer: Send {
    /// Every cycle's snapshot while the window is open.
    fn on_snapshot(&mut self, _snapshot: &DemographicCounts, _report: &CycleReport) {}

    /// Final snapshot once the window has closed and the source is released.
    fn on_window_closed(&mut self, summary: &WindowSummary);
}

/// Outcome of one capture window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WindowSummary {
    pub source: String,
    pub snapshot: DemographicCounts,
    pub cycles_run: u32,
    pub cycles_skipped: u32,
    pub timeouts: u32,
    pub duration_ms: u64,
    /// Detection was disabled during or before the window.
    pub detection_disabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSchedule {
    /// Time between cycle ticks.
    pub interval: Duration,
    /// Window length.
    pub window: Duration,
}

/// Scoped acquisition of a frame source. Disconnects on drop.
pub struct CaptureWindow<'a> {
    source: &'a mut dyn FrameSource,
    opened_at: Instant,
}

impl<'a> CaptureWindow<'a> {
    pub fn open(source: &'a mut dyn FrameSource) -> Result<Self> {
        source.connect()?;
        log::debug!("capture window opened on {}", source.name());
        Ok(Self {
            source,
            opened_at: Instant::now(),
        })
    }

    pub fn source(&mut self) -> &mut dyn FrameSource {
        &mut *self.source
    }

    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

impl Drop for CaptureWindow<'_> {
    fn drop(&mut self) {
        self.source.disconnect();
        log::debug!("capture window closed on {}", self.source.name());
    }
}

/// Run cycles on every tick until the window elapses or `shutdown` is set.
pub async fn run_capture_window(
    pipeline: &DetectionPipeline,
    source: &mut dyn FrameSource,
    schedule: CaptureSchedule,
    consumer: &mut dyn AdQueueConsumer,
    shutdown: &AtomicBool,
) -> Result<WindowSummary> {
    let mut summary = WindowSummary {
        source: source.name().to_string(),
        ..WindowSummary::default()
    };
    let mut window = CaptureWindow::open(source)?;
    let deadline = Instant::now() + schedule.window;

    let mut ticker = tokio::time::interval(schedule.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
        }
        if shutdown.load(Ordering::Acquire) || Instant::now() >= deadline {
            break;
        }

        let report = pipeline.run_cycle(window.source()).await;
        match report.outcome {
            CycleOutcome::Completed => summary.cycles_run += 1,
            CycleOutcome::TimedOut => {
                summary.cycles_run += 1;
                summary.timeouts += 1;
            }
            CycleOutcome::Skipped(_) => summary.cycles_skipped += 1,
        }
        consumer.on_snapshot(&report.snapshot, &report);
        if pipeline.is_disabled() {
            log::warn!("detection disabled; closing capture window early");
            break;
        }
    }

    summary.duration_ms = window.elapsed().as_millis() as u64;
    drop(window);

    summary.snapshot = pipeline.snapshot();
    summary.detection_disabled = pipeline.is_disabled();
    consumer.on_window_closed(&summary);
    Ok(summary)
}

/// Replace the active source and drop every track tied to the old one.
pub fn switch_source(
    pipeline: &DetectionPipeline,
    active: &mut Box<dyn FrameSource>,
    next: Box<dyn FrameSource>,
) {
    active.disconnect();
    log::info!("switching source {} -> {}", active.name(), next.name());
    *active = next;
    pipeline.reset();
}
