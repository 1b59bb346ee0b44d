use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use audience_kernel::config::{DetectionConfig, SourcePreset};
use audience_kernel::detect::DetectorMode;
use audience_kernel::geometry::Roi;
use audience_kernel::preprocess::QualityPreset;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AUDIENCE_CONFIG",
        "AUDIENCE_PRESET",
        "AUDIENCE_DETECTOR_MODE",
        "AUDIENCE_SENSITIVITY",
        "AUDIENCE_FEMALE_BOOST",
        "AUDIENCE_QUALITY_PRESET",
        "AUDIENCE_INTERVAL_MS",
        "AUDIENCE_DEBUG",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_to_webcam_preset_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DetectionConfig::load().expect("load config");
    assert_eq!(cfg, DetectionConfig::webcam());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "preset": "cctv",
        "sensitivity": 0.35,
        "roi": { "x": 0.25, "y": 0.1, "width": 0.5, "height": 0.8 },
        "tracking": { "hold_frames": 8 },
        "source": { "url": "stub://lobby", "width": 800, "height": 600 },
        "capture_window_secs": 12
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("AUDIENCE_CONFIG", file.path());
    std::env::set_var("AUDIENCE_DETECTOR_MODE", "ssd");
    std::env::set_var("AUDIENCE_INTERVAL_MS", "750");
    std::env::set_var("AUDIENCE_DEBUG", "yes");

    let cfg = DetectionConfig::load().expect("load config");

    assert_eq!(cfg.preset, SourcePreset::Cctv);
    assert_eq!(cfg.detector_mode, DetectorMode::Ssd);
    assert_eq!(cfg.sensitivity, 0.35);
    assert_eq!(
        cfg.roi,
        Some(Roi {
            x: 0.25,
            y: 0.1,
            width: 0.5,
            height: 0.8
        })
    );
    assert_eq!(cfg.tracking.hold_frames, 8);
    assert_eq!(cfg.tracking.vote_window, 9);
    assert!(cfg.passes.rescue_enabled);
    assert_eq!(cfg.source.url, "stub://lobby");
    assert_eq!((cfg.source.width, cfg.source.height), (800, 600));
    assert_eq!(cfg.capture_window, Duration::from_secs(12));
    assert_eq!(cfg.cycle_interval, Duration::from_millis(750));
    assert!(cfg.debug);

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        preset = "webcam"
        quality_preset = "low_light"
        cycle_timeout_ms = 2500

        [filter]
        min_face_size_px = 32.0

        [bias]
        female_boost = 0.2
    "#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("AUDIENCE_CONFIG", file.path());

    let cfg = DetectionConfig::load().expect("load config");

    assert_eq!(cfg.preset, SourcePreset::Webcam);
    assert_eq!(cfg.quality_preset, Some(QualityPreset::LowLight));
    assert_eq!(cfg.preprocessing.gamma, 1.6);
    assert_eq!(cfg.cycle_timeout, Duration::from_millis(2500));
    assert_eq!(cfg.filter.min_face_size_px, 32.0);
    assert_eq!(cfg.filter.min_face_score, 0.5);
    assert_eq!(cfg.bias.female_boost, 0.2);

    clear_env();
}

#[test]
fn env_preset_wins_over_file_preset() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "preset": "webcam" }"#).expect("write config");
    std::env::set_var("AUDIENCE_CONFIG", file.path());
    std::env::set_var("AUDIENCE_PRESET", "cctv");

    let cfg = DetectionConfig::load().expect("load config");
    assert_eq!(cfg.preset, SourcePreset::Cctv);
    assert_eq!(cfg.detector_mode, DetectorMode::Dual);

    clear_env();
}

#[test]
fn out_of_range_values_are_clamped_not_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "upscale": 9.0,
        "cycle_timeout_ms": 1,
        "roi": { "x": 0.8, "y": -0.2, "width": 0.6, "height": 0.5 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");
    std::env::set_var("AUDIENCE_CONFIG", file.path());
    std::env::set_var("AUDIENCE_SENSITIVITY", "0.95");
    std::env::set_var("AUDIENCE_FEMALE_BOOST", "0.8");

    let cfg = DetectionConfig::load().expect("load config");

    assert_eq!(cfg.sensitivity, 0.6);
    assert_eq!(cfg.bias.female_boost, 0.3);
    assert_eq!(cfg.upscale, 4.0);
    assert_eq!(cfg.cycle_timeout, Duration::from_millis(100));
    let roi = cfg.roi.expect("roi kept");
    assert!(roi.x >= 0.0 && roi.y >= 0.0);
    assert!(roi.x + roi.width <= 1.0 + f32::EPSILON);
    assert!(roi.y + roi.height <= 1.0 + f32::EPSILON);

    clear_env();
}

#[test]
fn rejects_unknown_fields_and_bad_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "sensitivty": 0.3 }"#).expect("write config");
    std::env::set_var("AUDIENCE_CONFIG", file.path());
    assert!(DetectionConfig::load().is_err());

    clear_env();
    std::env::set_var("AUDIENCE_SENSITIVITY", "high");
    let err = DetectionConfig::load().unwrap_err();
    assert!(err.to_string().contains("AUDIENCE_SENSITIVITY"));

    clear_env();
    std::env::set_var("AUDIENCE_DETECTOR_MODE", "yolo");
    assert!(DetectionConfig::load().is_err());

    clear_env();
    std::env::set_var("AUDIENCE_CONFIG", "/nonexistent/audience.json");
    assert!(DetectionConfig::load().is_err());

    clear_env();
}

#[test]
fn zero_interval_fails_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AUDIENCE_INTERVAL_MS", "0");
    let err = DetectionConfig::load().unwrap_err();
    assert!(err.to_string().contains("interval"));

    clear_env();
}
