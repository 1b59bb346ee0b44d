//! audienced - audience detection daemon
//!
//! This daemon:
//! 1. Loads the detection config (preset, file, environment)
//! 2. Loads face detectors once and keeps the ones that succeed
//! 3. Opens the configured frame source for each capture window
//! 4. Runs periodic detection cycles inside the window
//! 5. Prints snapshots and window summaries as JSON lines on stdout

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audience_kernel::{
    open_source, run_capture_window, AdQueueConsumer, BoundingBox, CaptureSchedule, CycleReport,
    DemographicCounts, DetectionConfig, DetectionPipeline, DetectorKind, FaceDetector, GenderSignal,
    ScriptedDetector, ScriptedFace, WindowSummary,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON), layered over the preset it names.
    #[arg(long, env = "AUDIENCE_CONFIG")]
    config: Option<PathBuf>,
    /// Override the source URL or image directory.
    #[arg(long)]
    source: Option<String>,
    /// ONNX weights for the fast detector.
    #[arg(long, env = "AUDIENCE_TINY_MODEL")]
    tiny_model: Option<PathBuf>,
    /// ONNX weights for the accurate detector.
    #[arg(long, env = "AUDIENCE_SSD_MODEL")]
    ssd_model: Option<PathBuf>,
    /// Model gender column convention: female or male probability.
    #[arg(long, default_value = "female")]
    gender_column: String,
    /// Replay faces from a JSON script instead of running models.
    #[arg(long)]
    script: Option<PathBuf>,
    /// Number of capture windows to run (0 = until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    windows: u32,
    /// Also print every per-cycle snapshot, not just window summaries.
    #[arg(long)]
    snapshots: bool,
}

/// One scripted face, normalized to the frame.
#[derive(Debug, Clone, Deserialize)]
struct ScriptEntry {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    score: f32,
    age: f32,
    female: f32,
}

struct JsonLinesConsumer {
    snapshots: bool,
    window: u64,
}

impl AdQueueConsumer for JsonLinesConsumer {
    fn on_snapshot(&mut self, snapshot: &DemographicCounts, report: &CycleReport) {
        if !self.snapshots || !report.ran() {
            return;
        }
        let line = serde_json::json!({
            "type": "snapshot",
            "window": self.window,
            "counts": snapshot,
            "results": report.results,
            "debug": report.debug,
        });
        println!("{}", line);
    }

    fn on_window_closed(&mut self, summary: &WindowSummary) {
        let line = serde_json::json!({
            "type": "window",
            "window": self.window,
            "summary": summary,
        });
        println!("{}", line);
        self.window += 1;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("AUDIENCE_CONFIG", path);
    }
    let mut cfg = DetectionConfig::load()?;
    if let Some(source) = &args.source {
        cfg.source.url = source.clone();
    }
    log::info!(
        "audienced {}: {:?} preset, {:?} mode, sensitivity {:.2}, source {}",
        env!("CARGO_PKG_VERSION"),
        cfg.preset,
        cfg.detector_mode,
        cfg.sensitivity,
        cfg.source.url
    );

    let script = match &args.script {
        Some(path) => Some(load_script(path)?),
        None => None,
    };
    let female_column = match args.gender_column.to_ascii_lowercase().as_str() {
        "female" => true,
        "male" => false,
        other => return Err(anyhow!("--gender-column must be female or male, got '{}'", other)),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Release);
    })
    .context("error setting Ctrl-C handler")?;

    let passes = cfg.passes;
    let initialized = DetectionPipeline::initialize(cfg.clone(), |kind| {
        let model = match kind {
            DetectorKind::Tiny => args.tiny_model.clone(),
            DetectorKind::Ssd => args.ssd_model.clone(),
        };
        let script = script.clone();
        let sizes = passes.input_sizes(kind);
        async move { load_detector(kind, model, script, female_column, sizes) }
    })
    .await;
    let pipeline = match initialized {
        Ok(pipeline) => pipeline,
        Err(e) => {
            // Ad playback carries on without demographics.
            log::error!("{}; detection disabled for this session", e);
            wait_for_shutdown(&shutdown).await;
            return Ok(());
        }
    };

    let schedule = CaptureSchedule {
        interval: cfg.cycle_interval,
        window: cfg.capture_window,
    };
    let mut consumer = JsonLinesConsumer {
        snapshots: args.snapshots,
        window: 0,
    };
    let mut windows_run = 0u32;

    while !shutdown.load(Ordering::Acquire) {
        if pipeline.is_disabled() {
            // Ad playback carries on without demographics.
            log::error!("detection disabled for this session; stopping capture");
            break;
        }
        let mut source = open_source(&cfg.source)?;
        match run_capture_window(&pipeline, source.as_mut(), schedule, &mut consumer, &shutdown).await {
            Ok(summary) => log::info!(
                "window closed: {} cycles, {} skipped, {} timeouts, {} people",
                summary.cycles_run,
                summary.cycles_skipped,
                summary.timeouts,
                summary.snapshot.total()
            ),
            Err(e) => {
                log::warn!("capture window failed: {:#}", e);
                tokio::time::sleep(cfg.cycle_interval).await;
            }
        }
        windows_run += 1;
        if args.windows > 0 && windows_run >= args.windows {
            break;
        }
    }

    log::info!("audienced stopped after {} windows", windows_run);
    Ok(())
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn load_script(path: &Path) -> Result<Vec<ScriptedFace>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    let entries: Vec<ScriptEntry> =
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid script {}: {}", path.display(), e))?;
    Ok(entries
        .into_iter()
        .map(|e| {
            ScriptedFace::new(
                BoundingBox::new(e.x, e.y, e.width, e.height),
                e.score,
                e.age,
                GenderSignal::Female(e.female),
            )
        })
        .collect())
}

fn load_detector(
    kind: DetectorKind,
    model: Option<PathBuf>,
    script: Option<Vec<ScriptedFace>>,
    female_column: bool,
    input_sizes: Vec<u32>,
) -> Result<Arc<dyn FaceDetector>> {
    if let Some(faces) = script {
        return Ok(Arc::new(ScriptedDetector::new(kind).with_faces(faces)));
    }
    let path = model.ok_or_else(|| anyhow!("no weights configured for {} detector", kind))?;
    load_model(kind, path, female_column, input_sizes)
}

#[cfg(feature = "backend-tract")]
fn load_model(
    kind: DetectorKind,
    path: PathBuf,
    female_column: bool,
    input_sizes: Vec<u32>,
) -> Result<Arc<dyn FaceDetector>> {
    use audience_kernel::{GenderColumn, TractDetector, TractModelSpec};

    let gender_column = if female_column {
        GenderColumn::Female
    } else {
        GenderColumn::Male
    };
    let detector = TractDetector::load(TractModelSpec {
        kind,
        path,
        gender_column,
        input_sizes,
    })?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(
    kind: DetectorKind,
    path: PathBuf,
    _female_column: bool,
    _input_sizes: Vec<u32>,
) -> Result<Arc<dyn FaceDetector>> {
    Err(anyhow!(
        "{} detector weights {} need the backend-tract feature",
        kind,
        path.display()
    ))
}
