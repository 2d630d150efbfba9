//! IVF file capture source
//!
//! Streams pre-encoded VP8/VP9/AV1 frames from an IVF container, paced at
//! the session frame rate. Used by the command line front end.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use webrtc::media::io::ivf_reader::IVFReader;

use super::capture::{CaptureConfig, CaptureSource};
use super::format::{Resolution, VideoCodec};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Default pacing before a capture config is applied
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Capture source reading frames from an in-memory IVF file
pub struct IvfFileSource {
    name: String,
    data: Bytes,
    reader: Option<IVFReader<Cursor<Bytes>>>,
    codec: VideoCodec,
    resolution: Resolution,
    looping: bool,
    pacer: Option<Interval>,
    frame_interval: Duration,
    sequence: u64,
    frames_this_pass: u64,
}

impl IvfFileSource {
    /// Load an IVF file from disk
    pub async fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(path.display().to_string(), Bytes::from(data), looping)
    }

    /// Build a source over IVF data already in memory
    pub fn from_bytes(name: impl Into<String>, data: Bytes, looping: bool) -> Result<Self> {
        let name = name.into();
        let (reader, header) = IVFReader::new(Cursor::new(data.clone()))
            .map_err(|e| AppError::InvalidConfig(format!("{}: invalid IVF file: {}", name, e)))?;

        let codec = VideoCodec::from_ivf_fourcc(&header.four_cc).ok_or_else(|| {
            AppError::InvalidConfig(format!(
                "{}: unsupported IVF codec {}",
                name,
                String::from_utf8_lossy(&header.four_cc)
            ))
        })?;
        let resolution = Resolution::new(header.width as u32, header.height as u32);

        info!("Opened IVF source {} ({} {})", name, codec, resolution);

        Ok(Self {
            name,
            data,
            reader: Some(reader),
            codec,
            resolution,
            looping,
            pacer: None,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            sequence: 0,
            frames_this_pass: 0,
        })
    }

    /// Resolution declared in the IVF header
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn rewind(&mut self) -> Result<()> {
        let (reader, _) = IVFReader::new(Cursor::new(self.data.clone()))
            .map_err(|e| AppError::InvalidConfig(format!("{}: rewind failed: {}", self.name, e)))?;
        self.reader = Some(reader);
        self.frames_this_pass = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Option<Bytes> {
        let reader = self.reader.as_mut()?;
        match reader.parse_next_frame() {
            Ok((frame, _header)) => Some(frame.freeze()),
            Err(e) => {
                debug!("IVF source {} reached end: {}", self.name, e);
                None
            }
        }
    }
}

#[async_trait]
impl CaptureSource for IvfFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> VideoCodec {
        self.codec
    }

    async fn configure(&mut self, config: CaptureConfig) -> Result<()> {
        if config.resolution() != self.resolution {
            warn!(
                "IVF source {} is {}, session requested {}; frames are sent as encoded",
                self.name,
                self.resolution,
                config.resolution()
            );
        }
        self.frame_interval = config.frame_interval();
        let mut pacer = interval(self.frame_interval);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.pacer = Some(pacer);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        if self.reader.is_none() {
            return Ok(None);
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.tick().await;
        }

        let data = match self.read_frame() {
            Some(data) => data,
            None if self.looping && self.frames_this_pass > 0 => {
                self.rewind()?;
                match self.read_frame() {
                    Some(data) => data,
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };

        let frame = VideoFrame::new(data, self.frame_interval, self.sequence);
        self.sequence += 1;
        self.frames_this_pass += 1;
        Ok(Some(frame))
    }

    async fn release(&mut self) {
        self.reader = None;
        self.pacer = None;
        debug!("IVF source {} released after {} frames", self.name, self.sequence);
    }
}
