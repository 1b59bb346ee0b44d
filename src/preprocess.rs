//! Frame enhancement for rescue passes.
//!
//! Order of operations: ROI crop, gamma + contrast (one lookup table), box-blur
//! denoise, unsharp-mask sharpen, upscale. The ROI crop always comes first so
//! every later step works on fewer pixels and the returned `FrameMapping` only
//! has to carry one offset and one scale.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameMapping};
use crate::geometry::Roi;

/// Enhancement parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingOptions {
    /// Power-law exponent denominator. `1.0` leaves pixels unchanged, `> 1.0` brightens.
    pub gamma: f32,
    /// Linear gain around mid-gray. `1.0` leaves pixels unchanged.
    pub contrast: f32,
    /// Unsharp-mask blend strength in `0..=1`.
    pub sharpen: f32,
    /// 3x3 box blur before sharpening.
    pub denoise: bool,
}

impl PreprocessingOptions {
    pub fn neutral() -> Self {
        Self {
            gamma: 1.0,
            contrast: 1.0,
            sharpen: 0.0,
            denoise: false,
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.gamma == 1.0 && self.contrast == 1.0 && self.sharpen <= 0.0 && !self.denoise
    }
}

impl Default for PreprocessingOptions {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Named capture-quality scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    Indoor,
    Outdoor,
    NightIr,
    LowLight,
    LowQualityCctv,
    Crowd,
}

/// `(preset, gamma, contrast, sharpen)`.
const QUALITY_PRESETS: &[(QualityPreset, f32, f32, f32)] = &[
    (QualityPreset::Indoor, 1.1, 1.1, 0.2),
    (QualityPreset::Outdoor, 0.9, 1.15, 0.25),
    (QualityPreset::NightIr, 1.8, 1.4, 0.3),
    (QualityPreset::LowLight, 1.6, 1.3, 0.35),
    (QualityPreset::LowQualityCctv, 1.2, 1.35, 0.6),
    (QualityPreset::Crowd, 1.1, 1.2, 0.45),
];

impl QualityPreset {
    pub const ALL: [QualityPreset; 6] = [
        QualityPreset::Indoor,
        QualityPreset::Outdoor,
        QualityPreset::NightIr,
        QualityPreset::LowLight,
        QualityPreset::LowQualityCctv,
        QualityPreset::Crowd,
    ];

    /// Apply this preset's magnitudes, keeping the caller's denoise choice.
    pub fn apply_to(self, base: PreprocessingOptions) -> PreprocessingOptions {
        match QUALITY_PRESETS.iter().find(|(preset, ..)| *preset == self) {
            Some(&(_, gamma, contrast, sharpen)) => PreprocessingOptions {
                gamma,
                contrast,
                sharpen,
                denoise: base.denoise,
            },
            None => base,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "indoor" => Ok(QualityPreset::Indoor),
            "outdoor" => Ok(QualityPreset::Outdoor),
            "night_ir" | "night" | "ir" => Ok(QualityPreset::NightIr),
            "low_light" => Ok(QualityPreset::LowLight),
            "low_quality_cctv" | "cctv" => Ok(QualityPreset::LowQualityCctv),
            "crowd" => Ok(QualityPreset::Crowd),
            other => Err(anyhow!("unknown quality preset '{}'", other)),
        }
    }
}

/// Builds working frames for the detection passes.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    options: PreprocessingOptions,
    upscale: f32,
    roi: Option<Roi>,
}

impl Preprocessor {
    pub fn new(options: PreprocessingOptions, upscale: f32, roi: Option<Roi>) -> Self {
        Self {
            options,
            upscale: upscale.max(1.0),
            roi: roi.map(|r| r.clamped()),
        }
    }

    pub fn options(&self) -> PreprocessingOptions {
        self.options
    }

    pub fn upscale(&self) -> f32 {
        self.upscale
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// ROI-only working frame. `None` when no ROI is configured and the source
    /// frame can be used as-is.
    pub fn crop_roi(&self, frame: &Frame) -> Result<Option<(Frame, FrameMapping)>> {
        let Some(roi) = self.roi else {
            return Ok(None);
        };
        let (x, y, w, h) = roi.to_pixels(frame.width(), frame.height());
        let cropped = frame.crop(x, y, w, h)?;
        Ok(Some((
            cropped,
            FrameMapping {
                scale: 1.0,
                offset_x: x as f32,
                offset_y: y as f32,
            },
        )))
    }

    /// Full enhancement: ROI, tone curve, denoise, sharpen, upscale.
    ///
    /// Output dimensions are `(roi or source) * upscale`.
    pub fn enhance(&self, frame: &Frame) -> Result<(Frame, FrameMapping)> {
        let (working, mut mapping) = match self.crop_roi(frame)? {
            Some(cropped) => cropped,
            None => (
                frame.crop(0, 0, frame.width(), frame.height())?,
                FrameMapping::identity(),
            ),
        };
        let captured_at = working.captured_at_ms();
        let (mut pixels, width, height) = working.into_parts();

        apply_tone_curve(&mut pixels, self.options.gamma, self.options.contrast);
        if self.options.denoise {
            pixels = box_blur(&pixels, width, height);
        }
        if self.options.sharpen > 0.0 {
            pixels = sharpen(&pixels, width, height, self.options.sharpen);
        }

        let mut enhanced = Frame::new(pixels, width, height)?.with_capture_time(captured_at);
        if self.upscale > 1.0 {
            enhanced = upscale(&enhanced, self.upscale)?;
            mapping.scale = enhanced.width() as f32 / width as f32;
        }
        Ok((enhanced, mapping))
    }
}

fn tone_lut(gamma: f32, contrast: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let inv_gamma = 1.0 / gamma.max(0.01);
    for (i, slot) in lut.iter_mut().enumerate() {
        let corrected = 255.0 * (i as f32 / 255.0).powf(inv_gamma);
        let stretched = (corrected - 128.0) * contrast + 128.0;
        *slot = stretched.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Gamma followed by contrast, in place.
pub fn apply_tone_curve(pixels: &mut [u8], gamma: f32, contrast: f32) {
    if gamma == 1.0 && contrast == 1.0 {
        return;
    }
    let lut = tone_lut(gamma, contrast);
    for p in pixels.iter_mut() {
        *p = lut[*p as usize];
    }
}

const BOX_KERNEL: [f32; 9] = [1.0 / 9.0; 9];
const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

/// 3x3 convolution of the interior. Border pixels keep their source values.
fn convolve3x3(pixels: &[u8], width: u32, height: u32, kernel: &[f32; 9]) -> Option<Vec<u8>> {
    if width < 3 || height < 3 {
        return None;
    }
    let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(width, height, pixels)?;
    let mut out = imageops::filter3x3(&view, kernel);
    for x in 0..width {
        for y in [0, height - 1] {
            out.put_pixel(x, y, *view.get_pixel(x, y));
        }
    }
    for y in 0..height {
        for x in [0, width - 1] {
            out.put_pixel(x, y, *view.get_pixel(x, y));
        }
    }
    Some(out.into_raw())
}

/// 3x3 mean filter.
pub fn box_blur(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    convolve3x3(pixels, width, height, &BOX_KERNEL).unwrap_or_else(|| pixels.to_vec())
}

/// 3x3 unsharp mask (`5` centre, `-1` cross) blended with the input by `strength`.
pub fn sharpen(pixels: &[u8], width: u32, height: u32, strength: f32) -> Vec<u8> {
    let strength = strength.clamp(0.0, 1.0);
    let Some(sharpened) = convolve3x3(pixels, width, height, &SHARPEN_KERNEL) else {
        return pixels.to_vec();
    };
    pixels
        .iter()
        .zip(&sharpened)
        .map(|(&centre, &sharp)| {
            let centre = centre as f32;
            (centre + strength * (sharp as f32 - centre)).round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Bilinear upscale by `factor`.
pub fn upscale(frame: &Frame, factor: f32) -> Result<Frame> {
    let view = frame
        .as_image()
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    let width = ((frame.width() as f32) * factor).round().max(1.0) as u32;
    let height = ((frame.height() as f32) * factor).round().max(1.0) as u32;
    let resized = imageops::resize(&view, width, height, FilterType::Triangle);
    Ok(Frame::from_image(resized)?.with_capture_time(frame.captured_at_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_tone_curve_is_identity() {
        let mut pixels: Vec<u8> = (0..=255).collect();
        apply_tone_curve(&mut pixels, 1.0, 1.0);
        assert_eq!(pixels, (0..=255).collect::<Vec<u8>>());
    }

    #[test]
    fn gamma_brightens_midtones() {
        let mut pixels = vec![64u8, 128, 0, 255];
        apply_tone_curve(&mut pixels, 2.0, 1.0);
        // 255 * (64/255)^0.5 = 127.75
        assert_eq!(pixels[0], 128);
        assert!(pixels[1] > 128);
        assert_eq!(pixels[2], 0);
        assert_eq!(pixels[3], 255);
    }

    #[test]
    fn contrast_stretches_around_mid_gray() {
        let mut pixels = vec![128u8, 138, 118, 250];
        apply_tone_curve(&mut pixels, 1.0, 2.0);
        assert_eq!(pixels, vec![128, 148, 108, 255]);
    }

    #[test]
    fn blur_flattens_single_spike() {
        let mut pixels = vec![0u8; 3 * 3 * 3];
        pixels[(1 * 3 + 1) * 3] = 90;
        let out = box_blur(&pixels, 3, 3);
        assert_eq!(out[(1 * 3 + 1) * 3], 10);
    }

    #[test]
    fn sharpen_leaves_flat_regions_alone() {
        let pixels = vec![77u8; 4 * 4 * 3];
        assert_eq!(sharpen(&pixels, 4, 4, 1.0), pixels);
    }

    #[test]
    fn sharpen_steepens_interior_edges() {
        // 5x5, dark left half and bright right half.
        let pixels: Vec<u8> = (0..25)
            .flat_map(|i| {
                let v = if i % 5 < 2 { 50u8 } else { 150 };
                [v, v, v]
            })
            .collect();
        let out = sharpen(&pixels, 5, 5, 1.0);
        let at = |x: usize, y: usize| out[(y * 5 + x) * 3];
        assert!(at(1, 2) < 50);
        assert!(at(2, 2) > 150);
        assert_eq!(at(0, 0), 50);
        assert_eq!(at(4, 4), 150);
    }

    #[test]
    fn tiny_frames_pass_through_kernels() {
        let pixels: Vec<u8> = (0..12).map(|v| (v * 20) as u8).collect();
        assert_eq!(box_blur(&pixels, 2, 2), pixels);
        assert_eq!(sharpen(&pixels, 2, 2, 1.0), pixels);
    }

    #[test]
    fn sharpen_zero_strength_is_identity() {
        let pixels: Vec<u8> = (0..48).map(|v| (v * 5) as u8).collect();
        assert_eq!(sharpen(&pixels, 4, 4, 0.0), pixels);
    }

    #[test]
    fn enhance_applies_roi_and_upscale() {
        let frame = Frame::filled(200, 100, [100, 100, 100]).unwrap();
        let roi = Roi {
            x: 0.5,
            y: 0.0,
            width: 0.5,
            height: 0.5,
        };
        let pre = Preprocessor::new(PreprocessingOptions::neutral(), 2.0, Some(roi));
        let (out, mapping) = pre.enhance(&frame).unwrap();
        assert_eq!((out.width(), out.height()), (200, 100));
        assert_eq!(mapping.offset_x, 100.0);
        assert_eq!(mapping.offset_y, 0.0);
        assert_eq!(mapping.scale, 2.0);
    }

    #[test]
    fn crop_roi_absent_without_roi() {
        let frame = Frame::filled(10, 10, [0, 0, 0]).unwrap();
        let pre = Preprocessor::new(PreprocessingOptions::neutral(), 1.0, None);
        assert!(pre.crop_roi(&frame).unwrap().is_none());
    }

    #[test]
    fn presets_are_table_driven_and_keep_denoise() {
        let base = PreprocessingOptions {
            denoise: true,
            ..PreprocessingOptions::neutral()
        };
        for preset in QualityPreset::ALL {
            let opts = preset.apply_to(base);
            assert!(opts.denoise);
            assert!(opts.gamma > 0.0);
            assert!((0.0..=1.0).contains(&opts.sharpen));
        }
        assert_eq!(
            QualityPreset::NightIr.apply_to(base).gamma,
            1.8,
        );
    }

    #[test]
    fn preset_parse_accepts_aliases() {
        assert_eq!(QualityPreset::parse("night-ir").unwrap(), QualityPreset::NightIr);
        assert_eq!(
            QualityPreset::parse("LOW_QUALITY_CCTV").unwrap(),
            QualityPreset::LowQualityCctv
        );
        assert!(QualityPreset::parse("underwater").is_err());
    }
}
