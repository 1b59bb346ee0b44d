//! demo - scripted end-to-end walk-through of the audience kernel
//!
//! Two people walk past a synthetic camera. The first is seen clearly, the
//! second only as a weak detection that the rescue pass recovers, and the first
//! is briefly occluded before both leave. Each cycle's results are printed.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;

use audience_kernel::ingest::SyntheticConfig;
use audience_kernel::{
    BoundingBox, CycleReport, DetectionConfig, DetectionPipeline, DetectorKind, DetectorSet, FaceDetector,
    FrameSource, GenderSignal, ScriptedDetector, ScriptedFace, SourcePreset, SyntheticSource,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// webcam or cctv.
    #[arg(long, default_value = "cctv")]
    preset: String,
    /// Number of cycles to run.
    #[arg(long, default_value_t = 14)]
    cycles: u32,
    /// Print each cycle report as a JSON line instead of a summary line.
    #[arg(long)]
    json: bool,
}

/// A person on a straight path, visible on a range of cycles.
struct Walker {
    start: (f32, f32),
    step: (f32, f32),
    size: f32,
    visible: std::ops::Range<u32>,
    occluded: std::ops::Range<u32>,
    score: f32,
    age: f32,
    gender: GenderSignal,
}

impl Walker {
    fn bbox_at(&self, cycle: u32) -> Option<BoundingBox> {
        if !self.visible.contains(&cycle) || self.occluded.contains(&cycle) {
            return None;
        }
        let t = (cycle - self.visible.start) as f32;
        Some(BoundingBox::new(
            self.start.0 + self.step.0 * t,
            self.start.1 + self.step.1 * t,
            self.size,
            self.size,
        ))
    }
}

fn cast() -> Vec<Walker> {
    vec![
        Walker {
            start: (60.0, 150.0),
            step: (18.0, 0.0),
            size: 110.0,
            visible: 0..11,
            occluded: 5..7,
            score: 0.88,
            age: 41.0,
            gender: GenderSignal::Female(0.46),
        },
        Walker {
            start: (470.0, 200.0),
            step: (-12.0, 2.0),
            size: 70.0,
            visible: 3..13,
            occluded: 0..0,
            score: 0.32,
            age: 9.0,
            gender: GenderSignal::Male(0.7),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.cycles == 0 {
        return Err(anyhow!("cycles must be >= 1"));
    }

    let mut cfg = DetectionConfig::preset(SourcePreset::parse(&args.preset)?);
    cfg.debug = true;

    let tiny = Arc::new(ScriptedDetector::new(DetectorKind::Tiny));
    let ssd = Arc::new(ScriptedDetector::new(DetectorKind::Ssd));
    let mut detectors: Vec<Arc<dyn FaceDetector>> = Vec::new();
    for kind in cfg.detector_mode.kinds() {
        match kind {
            DetectorKind::Tiny => detectors.push(tiny.clone()),
            DetectorKind::Ssd => detectors.push(ssd.clone()),
        }
    }
    let pipeline = DetectionPipeline::new(cfg, DetectorSet::from_detectors(detectors)?);

    let mut source = SyntheticSource::new(SyntheticConfig {
        name: "stub://demo".to_string(),
        width: WIDTH,
        height: HEIGHT,
        ..SyntheticConfig::default()
    });
    source.connect()?;

    let walkers = cast();
    for cycle in 0..args.cycles {
        let mut patches = Vec::new();
        let mut faces = Vec::new();
        for walker in &walkers {
            if let Some(bbox) = walker.bbox_at(cycle) {
                patches.push(bbox);
                faces.push(ScriptedFace::from_pixels(
                    bbox,
                    WIDTH,
                    HEIGHT,
                    walker.score,
                    walker.age,
                    walker.gender,
                ));
            }
        }
        source.set_patches(patches);
        tiny.set_faces(faces.clone());
        ssd.set_faces(faces);

        let report = pipeline.run_cycle(&mut source).await;
        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print_report(cycle, &report);
        }
    }

    source.disconnect();
    let snapshot = pipeline.snapshot();
    println!(
        "final: male={} female={} kid={} young={} adult={}",
        snapshot.male, snapshot.female, snapshot.kid, snapshot.young, snapshot.adult
    );
    Ok(())
}

fn print_report(cycle: u32, report: &CycleReport) {
    let debug = &report.debug;
    let detector = debug
        .detector_used
        .map(|k| k.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "cycle {:>2}: pass={} detector={:<4} raw={} kept={} tracks={} confirmed={}",
        cycle,
        debug.pass_used,
        detector,
        debug.raw_count,
        debug.filtered_count,
        debug.track_count,
        debug.confirmed_count
    );
    for result in &report.results {
        println!(
            "    #{} {:?} {:?} conf={:.2} score={:.2} state={:?} at ({:.0},{:.0})",
            result.tracking_id,
            result.gender,
            result.age_group,
            result.confidence,
            result.face_score,
            result.state,
            result.bbox.x,
            result.bbox.y
        );
    }
}
