//! Frame ingestion sources.
//!
//! The pipeline only needs three things from a video source: the current frame on
//! demand, its dimensions and a readiness predicate. This module provides:
//! - Synthetic source (`stub://`, tests and demos)
//! - Looping image-sequence source (directory of stills)
//! - Push source (frames handed in by an external capturer, e.g. screen capture)
//!
//! Sources MUST NOT:
//! - Store frames to disk
//! - Transmit frames over network
//! - Log frame content

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::config::SourceSettings;
use crate::frame::Frame;

pub mod file;
mod normalize;
pub mod push;
pub mod synthetic;

pub use file::ImageSequenceSource;
pub use normalize::{normalize_to_rgb, PixelFormat};
pub use push::{PushHandle, PushSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Video Source Provider boundary.
pub trait FrameSource: Send {
    /// Human-readable source identifier (URL or path).
    fn name(&self) -> &str;

    /// Acquire the underlying resource.
    fn connect(&mut self) -> Result<()>;

    /// Release the underlying resource. Idempotent.
    fn disconnect(&mut self);

    /// A frame can be decoded right now.
    fn is_ready(&self) -> bool;

    /// Current frame dimensions, once known.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Capture the current frame.
    fn next_frame(&mut self) -> Result<Frame>;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub name: String,
    pub connected: bool,
}

/// Open the source named by the settings: `stub://` URLs are synthetic, local
/// directories are image sequences.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            name: url.to_string(),
            width: settings.width,
            height: settings.height,
            ..SyntheticConfig::default()
        })));
    }
    if url.contains("://") {
        return Err(anyhow!(
            "unsupported source '{}': only stub:// and local directories are supported",
            url
        ));
    }
    let path = Path::new(url);
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::new(path)?));
    }
    Err(anyhow!("source '{}' is not a directory of images", url))
}
