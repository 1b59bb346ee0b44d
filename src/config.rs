use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::classify::{BiasCorrection, MAX_FEMALE_BOOST};
use crate::detect::DetectorMode;
use crate::filter::{FilterBounds, TextureCheck};
use crate::geometry::Roi;
use crate::orchestrator::PassConfig;
use crate::preprocess::{PreprocessingOptions, QualityPreset};
use crate::tracker::TrackingConfig;

const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_CYCLE_TIMEOUT_MS: u64 = 10_000;
const MIN_CYCLE_TIMEOUT_MS: u64 = 100;
const DEFAULT_CAPTURE_WINDOW_SECS: u64 = 30;

pub const SENSITIVITY_MIN: f32 = 0.2;
pub const SENSITIVITY_MAX: f32 = 0.6;

/// Canonical capture scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePreset {
    /// Single fast detector, no rescue passes, tight size bounds.
    Webcam,
    /// Dual detector, rescue passes, loose size bounds, strong preprocessing.
    Cctv,
}

impl SourcePreset {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webcam" => Ok(SourcePreset::Webcam),
            "cctv" | "video" => Ok(SourcePreset::Cctv),
            other => Err(anyhow!("unknown preset '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    preset: Option<SourcePreset>,
    detector_mode: Option<DetectorMode>,
    sensitivity: Option<f32>,
    quality_preset: Option<QualityPreset>,
    preprocessing: Option<PreprocessingFile>,
    upscale: Option<f32>,
    roi: Option<Roi>,
    filter: Option<FilterFile>,
    texture: Option<TextureFile>,
    tracking: Option<TrackingFile>,
    passes: Option<PassesFile>,
    bias: Option<BiasFile>,
    cycle_timeout_ms: Option<u64>,
    cycle_interval_ms: Option<u64>,
    debug: Option<bool>,
    source: Option<SourceFile>,
    capture_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PreprocessingFile {
    gamma: Option<f32>,
    contrast: Option<f32>,
    sharpen: Option<f32>,
    denoise: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterFile {
    min_face_score: Option<f32>,
    min_face_size_px: Option<f32>,
    min_face_size_percent: Option<f32>,
    max_face_size_percent: Option<f32>,
    aspect_ratio_min: Option<f32>,
    aspect_ratio_max: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TextureFile {
    enabled: Option<bool>,
    min_edge_energy: Option<f32>,
    min_skin_ratio: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingFile {
    min_consecutive_frames: Option<u32>,
    hold_frames: Option<u32>,
    max_velocity_px: Option<f32>,
    iou_threshold: Option<f32>,
    vote_window: Option<usize>,
    smoothing: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PassesFile {
    tiny_input_size: Option<u32>,
    ssd_input_size: Option<u32>,
    rescue_enabled: Option<bool>,
    rescue_input_size: Option<u32>,
    fallback_enabled: Option<bool>,
    fallback_input_size: Option<u32>,
    score_margin: Option<f32>,
    rescue_threshold_drop: Option<f32>,
    fallback_floor: Option<f32>,
    absolute_min_score: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct BiasFile {
    female_boost: Option<f32>,
    hair_heuristic: Option<bool>,
    shape_heuristic: Option<bool>,
    heuristic_weight: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Where frames come from. Only the daemon reads this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Per-session detection settings. Immutable once a pipeline is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionConfig {
    pub preset: SourcePreset,
    pub detector_mode: DetectorMode,
    /// Score floor in `0.2..=0.6`.
    pub sensitivity: f32,
    /// When set, `preprocessing` was taken from this table row.
    pub quality_preset: Option<QualityPreset>,
    pub preprocessing: PreprocessingOptions,
    pub upscale: f32,
    pub roi: Option<Roi>,
    pub filter: FilterBounds,
    pub texture: TextureCheck,
    pub tracking: TrackingConfig,
    pub passes: PassConfig,
    pub bias: BiasCorrection,
    pub cycle_timeout: Duration,
    pub cycle_interval: Duration,
    pub debug: bool,
    pub source: SourceSettings,
    pub capture_window: Duration,
}

impl DetectionConfig {
    pub fn webcam() -> Self {
        Self {
            preset: SourcePreset::Webcam,
            detector_mode: DetectorMode::Tiny,
            sensitivity: 0.5,
            quality_preset: None,
            preprocessing: PreprocessingOptions::neutral(),
            upscale: 1.0,
            roi: None,
            filter: FilterBounds {
                min_face_score: 0.5,
                min_face_size_px: 40.0,
                min_face_size_percent: 0.5,
                max_face_size_percent: 35.0,
                aspect_ratio_min: 0.6,
                aspect_ratio_max: 1.6,
            },
            texture: TextureCheck::disabled(),
            tracking: TrackingConfig::default(),
            passes: PassConfig::default(),
            bias: BiasCorrection::default(),
            cycle_timeout: Duration::from_millis(DEFAULT_CYCLE_TIMEOUT_MS),
            cycle_interval: Duration::from_millis(1000),
            debug: false,
            source: SourceSettings {
                url: DEFAULT_SOURCE_URL.to_string(),
                width: DEFAULT_SOURCE_WIDTH,
                height: DEFAULT_SOURCE_HEIGHT,
            },
            capture_window: Duration::from_secs(DEFAULT_CAPTURE_WINDOW_SECS),
        }
    }

    pub fn cctv() -> Self {
        let quality = QualityPreset::LowQualityCctv;
        Self {
            preset: SourcePreset::Cctv,
            detector_mode: DetectorMode::Dual,
            sensitivity: 0.4,
            quality_preset: Some(quality),
            preprocessing: quality.apply_to(PreprocessingOptions {
                denoise: true,
                ..PreprocessingOptions::neutral()
            }),
            upscale: 2.0,
            roi: None,
            filter: FilterBounds {
                min_face_score: 0.3,
                min_face_size_px: 20.0,
                min_face_size_percent: 0.05,
                max_face_size_percent: 35.0,
                aspect_ratio_min: 0.5,
                aspect_ratio_max: 1.8,
            },
            texture: TextureCheck::disabled(),
            tracking: TrackingConfig {
                min_consecutive_frames: 2,
                hold_frames: 5,
                max_velocity_px: 160.0,
                iou_threshold: 0.15,
                vote_window: 9,
                smoothing: 0.5,
            },
            passes: PassConfig {
                rescue_enabled: true,
                fallback_enabled: true,
                ..PassConfig::default()
            },
            bias: BiasCorrection::default(),
            cycle_timeout: Duration::from_millis(DEFAULT_CYCLE_TIMEOUT_MS),
            cycle_interval: Duration::from_millis(1500),
            debug: false,
            source: SourceSettings {
                url: DEFAULT_SOURCE_URL.to_string(),
                width: 1280,
                height: 720,
            },
            capture_window: Duration::from_secs(DEFAULT_CAPTURE_WINDOW_SECS),
        }
    }

    pub fn preset(preset: SourcePreset) -> Self {
        match preset {
            SourcePreset::Webcam => Self::webcam(),
            SourcePreset::Cctv => Self::cctv(),
        }
    }

    /// Preset, then the file named by `AUDIENCE_CONFIG`, then environment
    /// overrides, then range clamping.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AUDIENCE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let file_cfg = file_cfg.unwrap_or_default();

        let preset = match std::env::var("AUDIENCE_PRESET") {
            Ok(value) if !value.trim().is_empty() => SourcePreset::parse(&value)?,
            _ => file_cfg.preset.unwrap_or(SourcePreset::Webcam),
        };
        let mut cfg = Self::preset(preset);
        cfg.apply_file(file_cfg);
        cfg.apply_env()?;
        cfg.clamp();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: DetectionConfigFile) {
        overlay(&mut self.detector_mode, file.detector_mode);
        overlay(&mut self.sensitivity, file.sensitivity);
        overlay(&mut self.upscale, file.upscale);
        if file.roi.is_some() {
            self.roi = file.roi;
        }
        if let Some(p) = file.preprocessing {
            overlay(&mut self.preprocessing.gamma, p.gamma);
            overlay(&mut self.preprocessing.contrast, p.contrast);
            overlay(&mut self.preprocessing.sharpen, p.sharpen);
            overlay(&mut self.preprocessing.denoise, p.denoise);
            // An explicit block overrides the preset's table row.
            self.quality_preset = None;
        }
        if let Some(q) = file.quality_preset {
            self.set_quality_preset(q);
        }
        if let Some(f) = file.filter {
            overlay(&mut self.filter.min_face_score, f.min_face_score);
            overlay(&mut self.filter.min_face_size_px, f.min_face_size_px);
            overlay(&mut self.filter.min_face_size_percent, f.min_face_size_percent);
            overlay(&mut self.filter.max_face_size_percent, f.max_face_size_percent);
            overlay(&mut self.filter.aspect_ratio_min, f.aspect_ratio_min);
            overlay(&mut self.filter.aspect_ratio_max, f.aspect_ratio_max);
        }
        if let Some(t) = file.texture {
            overlay(&mut self.texture.enabled, t.enabled);
            overlay(&mut self.texture.min_edge_energy, t.min_edge_energy);
            overlay(&mut self.texture.min_skin_ratio, t.min_skin_ratio);
        }
        if let Some(t) = file.tracking {
            overlay(&mut self.tracking.min_consecutive_frames, t.min_consecutive_frames);
            overlay(&mut self.tracking.hold_frames, t.hold_frames);
            overlay(&mut self.tracking.max_velocity_px, t.max_velocity_px);
            overlay(&mut self.tracking.iou_threshold, t.iou_threshold);
            overlay(&mut self.tracking.vote_window, t.vote_window);
            overlay(&mut self.tracking.smoothing, t.smoothing);
        }
        if let Some(p) = file.passes {
            overlay(&mut self.passes.tiny_input_size, p.tiny_input_size);
            overlay(&mut self.passes.ssd_input_size, p.ssd_input_size);
            overlay(&mut self.passes.rescue_enabled, p.rescue_enabled);
            overlay(&mut self.passes.rescue_input_size, p.rescue_input_size);
            overlay(&mut self.passes.fallback_enabled, p.fallback_enabled);
            overlay(&mut self.passes.fallback_input_size, p.fallback_input_size);
            overlay(&mut self.passes.score_margin, p.score_margin);
            overlay(&mut self.passes.rescue_threshold_drop, p.rescue_threshold_drop);
            overlay(&mut self.passes.fallback_floor, p.fallback_floor);
            overlay(&mut self.passes.absolute_min_score, p.absolute_min_score);
        }
        if let Some(b) = file.bias {
            overlay(&mut self.bias.female_boost, b.female_boost);
            overlay(&mut self.bias.hair_heuristic, b.hair_heuristic);
            overlay(&mut self.bias.shape_heuristic, b.shape_heuristic);
            overlay(&mut self.bias.heuristic_weight, b.heuristic_weight);
        }
        if let Some(ms) = file.cycle_timeout_ms {
            self.cycle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.cycle_interval_ms {
            self.cycle_interval = Duration::from_millis(ms);
        }
        overlay(&mut self.debug, file.debug);
        if let Some(s) = file.source {
            overlay(&mut self.source.url, s.url);
            overlay(&mut self.source.width, s.width);
            overlay(&mut self.source.height, s.height);
        }
        if let Some(secs) = file.capture_window_secs {
            self.capture_window = Duration::from_secs(secs);
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("AUDIENCE_DETECTOR_MODE") {
            if !mode.trim().is_empty() {
                self.detector_mode = DetectorMode::parse(&mode)
                    .ok_or_else(|| anyhow!("AUDIENCE_DETECTOR_MODE must be tiny, ssd or dual"))?;
            }
        }
        if let Ok(value) = std::env::var("AUDIENCE_SENSITIVITY") {
            self.sensitivity = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("AUDIENCE_SENSITIVITY must be a number"))?;
        }
        if let Ok(value) = std::env::var("AUDIENCE_FEMALE_BOOST") {
            self.bias.female_boost = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("AUDIENCE_FEMALE_BOOST must be a number"))?;
        }
        if let Ok(value) = std::env::var("AUDIENCE_QUALITY_PRESET") {
            if !value.trim().is_empty() {
                self.set_quality_preset(QualityPreset::parse(&value)?);
            }
        }
        if let Ok(value) = std::env::var("AUDIENCE_INTERVAL_MS") {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("AUDIENCE_INTERVAL_MS must be an integer number of milliseconds"))?;
            self.cycle_interval = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("AUDIENCE_DEBUG") {
            self.debug = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    /// Replace the preprocessing block with a table row, keeping the denoise flag.
    pub fn set_quality_preset(&mut self, preset: QualityPreset) {
        self.quality_preset = Some(preset);
        self.preprocessing = preset.apply_to(self.preprocessing);
    }

    /// Pull every ranged field into range. Returns the names of the fields that moved.
    pub fn clamp(&mut self) -> Vec<&'static str> {
        let mut clamped = Vec::new();
        clamp_field(&mut self.sensitivity, SENSITIVITY_MIN, SENSITIVITY_MAX, "sensitivity", &mut clamped);
        clamp_field(&mut self.bias.female_boost, 0.0, MAX_FEMALE_BOOST, "bias.female_boost", &mut clamped);
        clamp_field(&mut self.bias.heuristic_weight, 0.0, 1.0, "bias.heuristic_weight", &mut clamped);
        clamp_field(&mut self.upscale, 1.0, 4.0, "upscale", &mut clamped);
        clamp_field(&mut self.preprocessing.gamma, 0.1, 5.0, "preprocessing.gamma", &mut clamped);
        clamp_field(&mut self.preprocessing.contrast, 0.1, 4.0, "preprocessing.contrast", &mut clamped);
        clamp_field(&mut self.preprocessing.sharpen, 0.0, 1.0, "preprocessing.sharpen", &mut clamped);
        clamp_field(&mut self.filter.min_face_score, 0.0, 1.0, "filter.min_face_score", &mut clamped);
        clamp_field(
            &mut self.filter.min_face_size_percent,
            0.0,
            100.0,
            "filter.min_face_size_percent",
            &mut clamped,
        );
        clamp_field(
            &mut self.filter.max_face_size_percent,
            0.0,
            100.0,
            "filter.max_face_size_percent",
            &mut clamped,
        );
        clamp_field(&mut self.tracking.smoothing, 0.0, 1.0, "tracking.smoothing", &mut clamped);
        if self.tracking.min_consecutive_frames == 0 {
            self.tracking.min_consecutive_frames = 1;
            clamped.push("tracking.min_consecutive_frames");
        }
        if self.tracking.vote_window == 0 {
            self.tracking.vote_window = 1;
            clamped.push("tracking.vote_window");
        }
        if let Some(roi) = self.roi {
            let inside = roi.clamped();
            if inside != roi {
                self.roi = Some(inside);
                clamped.push("roi");
            }
        }
        if self.cycle_timeout < Duration::from_millis(MIN_CYCLE_TIMEOUT_MS) {
            self.cycle_timeout = Duration::from_millis(MIN_CYCLE_TIMEOUT_MS);
            clamped.push("cycle_timeout");
        }
        for field in &clamped {
            log::warn!("config value {} out of range, clamped", field);
        }
        clamped
    }

    fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be greater than zero"));
        }
        if self.cycle_interval.is_zero() {
            return Err(anyhow!("cycle interval must be greater than zero"));
        }
        if self.capture_window.is_zero() {
            return Err(anyhow!("capture window must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::webcam()
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn clamp_field(value: &mut f32, min: f32, max: f32, name: &'static str, clamped: &mut Vec<&'static str>) {
    let bounded = if value.is_nan() { min } else { value.clamp(min, max) };
    // NaN compares unequal, so it is reported too.
    if bounded != *value {
        *value = bounded;
        clamped.push(name);
    }
}

fn read_config_file(path: &Path) -> Result<DetectionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_where_the_scenarios_differ() {
        let webcam = DetectionConfig::webcam();
        let cctv = DetectionConfig::cctv();
        assert_eq!(webcam.detector_mode, DetectorMode::Tiny);
        assert!(!webcam.passes.rescue_enabled);
        assert!(webcam.preprocessing.is_neutral());
        assert_eq!(cctv.detector_mode, DetectorMode::Dual);
        assert!(cctv.passes.rescue_enabled && cctv.passes.fallback_enabled);
        assert!(cctv.filter.min_face_size_px < webcam.filter.min_face_size_px);
        assert!(cctv.preprocessing.denoise);
        assert_eq!(cctv.filter.min_face_score, 0.3);
        assert_eq!(webcam.filter.max_face_size_percent, 35.0);
    }

    #[test]
    fn presets_are_already_in_range() {
        assert!(DetectionConfig::webcam().clamp().is_empty());
        assert!(DetectionConfig::cctv().clamp().is_empty());
    }

    #[test]
    fn clamp_reports_each_moved_field() {
        let mut cfg = DetectionConfig::webcam();
        cfg.sensitivity = 0.9;
        cfg.bias.female_boost = 0.5;
        cfg.upscale = 0.5;
        cfg.cycle_timeout = Duration::from_millis(5);
        cfg.roi = Some(Roi {
            x: -0.1,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        });
        cfg.preprocessing.gamma = f32::NAN;

        let moved = cfg.clamp();
        assert_eq!(cfg.sensitivity, SENSITIVITY_MAX);
        assert_eq!(cfg.bias.female_boost, MAX_FEMALE_BOOST);
        assert_eq!(cfg.upscale, 1.0);
        assert_eq!(cfg.cycle_timeout, Duration::from_millis(MIN_CYCLE_TIMEOUT_MS));
        assert_eq!(cfg.preprocessing.gamma, 0.1);
        assert_eq!(cfg.roi.map(|r| r.x), Some(0.0));
        for field in ["sensitivity", "bias.female_boost", "upscale", "cycle_timeout", "roi", "preprocessing.gamma"] {
            assert!(moved.contains(&field), "{} not reported", field);
        }
    }

    #[test]
    fn explicit_preprocessing_block_drops_preset_row() {
        let mut cfg = DetectionConfig::cctv();
        cfg.apply_file(DetectionConfigFile {
            preprocessing: Some(PreprocessingFile {
                gamma: Some(1.0),
                ..PreprocessingFile::default()
            }),
            ..DetectionConfigFile::default()
        });
        assert_eq!(cfg.quality_preset, None);
        assert_eq!(cfg.preprocessing.gamma, 1.0);
        assert!(cfg.preprocessing.denoise);
    }

    #[test]
    fn quality_preset_replaces_tone_settings() {
        let mut cfg = DetectionConfig::webcam();
        cfg.set_quality_preset(QualityPreset::NightIr);
        assert_eq!(cfg.quality_preset, Some(QualityPreset::NightIr));
        assert_eq!(cfg.preprocessing.gamma, 1.8);
        assert!(!cfg.preprocessing.denoise);
    }
}
