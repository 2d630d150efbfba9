//! Capture configuration and capture sources
//!
//! A capture source produces encoded frames for the outgoing track. The
//! transport engine takes ownership of the source when the connection is
//! created and releases it on teardown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::format::{Resolution, VideoCodec};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Capture resolution and frame rate, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    width: u32,
    height: u32,
    framerate: u32,
}

impl CaptureConfig {
    /// Create a capture config; all values must be positive
    pub fn new(width: u32, height: u32, framerate: u32) -> Result<Self> {
        if width == 0 || height == 0 || framerate == 0 {
            return Err(AppError::InvalidConfig(format!(
                "capture config must be positive, got {}x{}@{}",
                width, height, framerate
            )));
        }
        Ok(Self {
            width,
            height,
            framerate,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Time between two frames at the configured rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.framerate
    }
}

impl fmt::Display for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.framerate)
    }
}

/// Capture quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CapturePreset {
    /// 1280x720 at 30 fps
    #[default]
    Hd720,
    /// 1920x1080 at 30 fps
    Hd1080,
}

impl CapturePreset {
    pub fn resolution(&self) -> Resolution {
        match self {
            CapturePreset::Hd720 => Resolution::HD720,
            CapturePreset::Hd1080 => Resolution::HD1080,
        }
    }

    pub fn framerate(&self) -> u32 {
        30
    }

    /// Capture config for this preset
    pub fn config(&self) -> CaptureConfig {
        let res = self.resolution();
        CaptureConfig {
            width: res.width,
            height: res.height,
            framerate: self.framerate(),
        }
    }
}

impl FromStr for CapturePreset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hd720" | "720p" | "720" => Ok(CapturePreset::Hd720),
            "hd1080" | "1080p" | "1080" => Ok(CapturePreset::Hd1080),
            other => Err(AppError::InvalidConfig(format!(
                "unknown capture preset '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CapturePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePreset::Hd720 => write!(f, "hd720"),
            CapturePreset::Hd1080 => write!(f, "hd1080"),
        }
    }
}

/// Producer of encoded video frames for the outgoing track
#[async_trait]
pub trait CaptureSource: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Codec of the produced frames
    fn codec(&self) -> VideoCodec;

    /// Apply the session capture config before the first frame is pulled
    async fn configure(&mut self, config: CaptureConfig) -> Result<()>;

    /// Next frame, or `None` once the source is exhausted
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>>;

    /// Release the underlying device
    async fn release(&mut self);
}

/// Capture source fed by an external producer through a channel
///
/// This is how an embedding application hands its capture grant over: it
/// keeps the sender and pushes encoded frames, the engine pulls them.
pub struct ChannelSource {
    name: String,
    codec: VideoCodec,
    rx: mpsc::Receiver<VideoFrame>,
    config: Option<CaptureConfig>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    pub fn new(
        name: impl Into<String>,
        codec: VideoCodec,
        capacity: usize,
    ) -> (Self, mpsc::Sender<VideoFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            name: name.into(),
            codec,
            rx,
            config: None,
        };
        (source, tx)
    }

    /// Config applied by the engine, if any
    pub fn config(&self) -> Option<CaptureConfig> {
        self.config
    }
}

#[async_trait]
impl CaptureSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn configure(&mut self, config: CaptureConfig) -> Result<()> {
        debug!("Capture source '{}' configured for {}", self.name, config);
        self.config = Some(config);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.rx.recv().await)
    }

    async fn release(&mut self) {
        self.rx.close();
        debug!("Capture source '{}' released", self.name);
    }
}
