//! Looping image-sequence source.
//!
//! Stands in for looping file playback: every JPEG/PNG in a local directory,
//! sorted by name, decoded on demand and replayed from the start at the end.
//!
//! The source MUST NOT:
//! - Fetch remote URLs
//! - Write decoded frames anywhere

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::{now_ms, Frame};

pub struct ImageSequenceSource {
    name: String,
    files: Vec<PathBuf>,
    cursor: usize,
    connected: bool,
    dimensions: Option<(u32, u32)>,
    frames_captured: u64,
}

impl ImageSequenceSource {
    pub fn new(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read image directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_supported_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no .jpg or .png images in {}", dir.display()));
        }
        Ok(Self {
            name: dir.display().to_string(),
            files,
            cursor: 0,
            connected: false,
            dimensions: None,
            frames_captured: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn decode(path: &Path) -> Result<Frame> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        Frame::from_image(image)
    }
}

impl FrameSource for ImageSequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<()> {
        let first = Self::decode(&self.files[0])?;
        self.dimensions = Some((first.width(), first.height()));
        self.connected = true;
        log::info!("ImageSequenceSource: {} images in {}", self.files.len(), self.name);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.cursor = 0;
    }

    fn is_ready(&self) -> bool {
        self.connected
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("{} is not connected", self.name));
        }
        let path = &self.files[self.cursor % self.files.len()];
        let frame = Self::decode(path)?.with_capture_time(now_ms());
        self.cursor = (self.cursor + 1) % self.files.len();
        self.dimensions = Some((frame.width(), frame.height()));
        self.frames_captured += 1;
        Ok(frame)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            name: self.name.clone(),
            connected: self.connected,
        }
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn loops_over_sorted_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::from_pixel(8, 6, Rgb([255, 0, 0])).save(dir.path().join("a.png"))?;
        RgbImage::from_pixel(8, 6, Rgb([0, 0, 255])).save(dir.path().join("b.png"))?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = ImageSequenceSource::new(dir.path())?;
        assert_eq!(source.len(), 2);
        assert!(!source.is_ready());
        source.connect()?;
        assert_eq!(source.dimensions(), Some((8, 6)));

        assert_eq!(source.next_frame()?.rgb(0, 0), [255, 0, 0]);
        assert_eq!(source.next_frame()?.rgb(0, 0), [0, 0, 255]);
        assert_eq!(source.next_frame()?.rgb(0, 0), [255, 0, 0]);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::new(dir.path()).is_err());
    }
}
