//! Synthetic source (`stub://`) for tests and demos.
//!
//! Produces a noisy background with optional skin-toned patches standing in for
//! faces, so texture and hair heuristics have something to look at.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceStats};
use crate::frame::{now_ms, Frame};
use crate::geometry::BoundingBox;

const SKIN: [u8; 3] = [224, 172, 140];

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub background: [u8; 3],
    /// Per-channel noise amplitude.
    pub noise: u8,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://synthetic".to_string(),
            width: 640,
            height: 480,
            background: [70, 80, 90],
            noise: 12,
            seed: 7,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    connected: bool,
    /// Simulates a stream that has not produced a decodable frame yet.
    stalled: bool,
    patches: Vec<BoundingBox>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            connected: false,
            stalled: false,
            patches: Vec::new(),
            frame_count: 0,
        }
    }

    /// Skin-toned rectangles drawn into every frame, in pixels.
    pub fn set_patches(&mut self, patches: Vec<BoundingBox>) {
        self.patches = patches;
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let w = self.config.width;
        let h = self.config.height;
        let noise = self.config.noise as i16;
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
                let inside = self
                    .patches
                    .iter()
                    .any(|p| fx >= p.x && fx < p.right() && fy >= p.y && fy < p.bottom());
                let base = if inside { SKIN } else { self.config.background };
                for channel in base {
                    let jitter = if noise > 0 { self.rng.gen_range(-noise..=noise) } else { 0 };
                    pixels.push((channel as i16 + jitter).clamp(0, 255) as u8);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.name);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: released {}", self.config.name);
        }
        self.connected = false;
    }

    fn is_ready(&self) -> bool {
        self.connected && !self.stalled
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.connected.then_some((self.config.width, self.config.height))
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.is_ready() {
            return Err(anyhow!("{} is not ready", self.config.name));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(pixels, self.config.width, self.config.height)?.with_capture_time(now_ms()))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            name: self.config.name.clone(),
            connected: self.connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig {
            width: 40,
            height: 30,
            noise: 0,
            ..SyntheticConfig::default()
        })
    }

    #[test]
    fn not_ready_until_connected() {
        let mut source = source();
        assert!(!source.is_ready());
        assert!(source.dimensions().is_none());
        assert!(source.next_frame().is_err());

        source.connect().unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (40, 30));
        assert_eq!(source.stats().frames_captured, 1);

        source.set_stalled(true);
        assert!(!source.is_ready());
        source.disconnect();
        assert!(!source.stats().connected);
    }

    #[test]
    fn patches_are_drawn_in_skin_tone() {
        let mut source = source();
        source.set_patches(vec![BoundingBox::new(10.0, 10.0, 5.0, 5.0)]);
        source.connect().unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!(frame.rgb(12, 12), SKIN);
        assert_eq!(frame.rgb(0, 0), [70, 80, 90]);
    }
}
