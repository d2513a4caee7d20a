//! Zero-copy camera-to-display pipeline.
//!
//! Frames captured by a V4L2 device land in dumb buffers allocated from the
//! DRM device and exported as DMA-BUF handles; the display controller scans
//! them out from an overlay plane without any CPU copy. The coordinator in
//! [`pipeline`] owns the per-buffer ownership handoff between the two drivers.

pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::capture::format::PixelFormat;

use crate::error::{Error, Result};

/// Destination rectangle in display space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One capture device and where its frames go on screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub device: PathBuf,
    pub dst: Rect,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DRM device node driving the display.
    pub card: PathBuf,
    /// Capture streams, one per camera. At least one required.
    pub streams: Vec<StreamConfig>,
    /// Shared buffer pool size per stream. Must be >= 2: single-buffering
    /// leaves the handoff no buffer to capture into.
    pub buffer_count: u32,
    /// Capture resolution requested from the camera; the driver may rewrite
    /// it and the accepted value is what flows downstream.
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Apply plane updates without waiting for vertical blank.
    pub async_flip: bool,
    /// Blocking-wait bound for the event loop; expiry is treated as a stall.
    pub poll_timeout_ms: u16,
    /// Consecutive hard retrieve errors tolerated before the loop gives up.
    pub max_consecutive_errors: u32,
    /// Fill the pool with SMPTE color bars before streaming starts.
    pub test_pattern: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            card: PathBuf::from("/dev/dri/card0"),
            streams: vec![StreamConfig {
                device: PathBuf::from("/dev/video0"),
                dst: Rect::new(0, 0, 480, 270),
            }],
            buffer_count: 4,
            width: 1920,
            height: 1080,
            format: PixelFormat::Uyvy,
            async_flip: false,
            poll_timeout_ms: 3000,
            max_consecutive_errors: 30,
            test_pattern: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 2 {
            return Err(Error::Config(format!(
                "buffer_count must be >= 2, got {}",
                self.buffer_count
            )));
        }
        if self.streams.is_empty() {
            return Err(Error::Config("at least one capture stream required".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config("capture resolution must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn single_buffering_rejected() {
        let cfg = Config {
            buffer_count: 1,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn empty_stream_list_rejected() {
        let cfg = Config {
            streams: Vec::new(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
