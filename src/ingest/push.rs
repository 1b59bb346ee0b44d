//! Push source for frames captured outside the crate (screen capture, a host
//! application's camera callback).
//!
//! The capturer holds a `PushHandle` and replaces the latest frame whenever it has
//! one; the pipeline samples whatever is latest when a cycle runs. Replaced and
//! released buffers are zeroized.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::frame::{now_ms, Frame};

struct Latest {
    rgb: Zeroizing<Vec<u8>>,
    width: u32,
    height: u32,
    captured_at_ms: u64,
}

#[derive(Default)]
struct Shared {
    latest: Option<Latest>,
    pushed: u64,
}

/// Capturer side of a `PushSource`.
#[derive(Clone)]
pub struct PushHandle {
    shared: Arc<Mutex<Shared>>,
}

impl PushHandle {
    /// Normalize and publish a frame, replacing the previous one.
    pub fn push(&self, pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(anyhow!("pushed frame dimensions must be non-zero"));
        }
        let rgb = Zeroizing::new(normalize_to_rgb(pixels, width, height, format)?);
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| anyhow!("push source lock poisoned"))?;
        shared.latest = Some(Latest {
            rgb,
            width,
            height,
            captured_at_ms: now_ms(),
        });
        shared.pushed += 1;
        Ok(())
    }

    /// Drop the current frame, e.g. when capture stops.
    pub fn clear(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.latest = None;
        }
    }
}

pub struct PushSource {
    name: String,
    shared: Arc<Mutex<Shared>>,
    connected: bool,
    frames_captured: u64,
}

impl PushSource {
    pub fn new(name: impl Into<String>) -> (Self, PushHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let handle = PushHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                name: name.into(),
                shared,
                connected: false,
                frames_captured: 0,
            },
            handle,
        )
    }

    pub fn frames_pushed(&self) -> u64 {
        self.shared.lock().map(|s| s.pushed).unwrap_or(0)
    }
}

impl FrameSource for PushSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        if let Ok(mut shared) = self.shared.lock() {
            shared.latest = None;
        }
    }

    fn is_ready(&self) -> bool {
        self.connected
            && self
                .shared
                .lock()
                .map(|s| s.latest.is_some())
                .unwrap_or(false)
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        let shared = self.shared.lock().ok()?;
        shared.latest.as_ref().map(|l| (l.width, l.height))
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("{} is not connected", self.name));
        }
        let shared = self
            .shared
            .lock()
            .map_err(|_| anyhow!("push source lock poisoned"))?;
        let latest = shared
            .latest
            .as_ref()
            .ok_or_else(|| anyhow!("{} has no frame yet", self.name))?;
        let frame = Frame::new(latest.rgb.to_vec(), latest.width, latest.height)?
            .with_capture_time(latest.captured_at_ms);
        drop(shared);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_pushed_frame_is_sampled() -> Result<()> {
        let (mut source, handle) = PushSource::new("screen:0");
        source.connect()?;
        assert!(!source.is_ready());

        handle.push(&[1, 2, 3, 255, 4, 5, 6, 255], 2, 1, PixelFormat::Rgba32)?;
        handle.push(&[9, 8, 7, 255, 6, 5, 4, 255], 2, 1, PixelFormat::Bgra32)?;
        assert!(source.is_ready());
        assert_eq!(source.dimensions(), Some((2, 1)));

        let frame = source.next_frame()?;
        assert_eq!(frame.rgb(0, 0), [7, 8, 9]);
        assert_eq!(source.frames_pushed(), 2);
        Ok(())
    }

    #[test]
    fn disconnect_releases_frame() -> Result<()> {
        let (mut source, handle) = PushSource::new("screen:0");
        source.connect()?;
        handle.push(&[0u8; 12], 2, 2, PixelFormat::Rgb24)?;
        source.disconnect();
        assert!(!source.is_ready());
        assert!(source.next_frame().is_err());
        assert!(handle.push(&[0u8; 5], 2, 2, PixelFormat::Rgb24).is_err());
        Ok(())
    }
}
