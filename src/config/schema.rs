use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::session::SessionController;
use crate::video::{CaptureConfig, CapturePreset};
use crate::webrtc::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture settings
    pub capture: CaptureSettings,
    /// WebRTC transport settings
    pub webrtc: WebRtcConfig,
    /// Session controller settings
    pub session: SessionSettings,
}

impl AppConfig {
    /// Reject values that would make a session unusable
    pub fn validate(&self) -> Result<()> {
        self.capture.capture_config()?;
        if self.session.event_queue_capacity == 0 {
            return Err(AppError::InvalidConfig(
                "session.event_queue_capacity must be positive".to_string(),
            ));
        }
        if self.webrtc.gathering_timeout_ms == 0 {
            return Err(AppError::InvalidConfig(
                "webrtc.gathering_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capture configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Resolution preset
    pub preset: CapturePreset,
    /// Frame rate override (fps), preset default when unset
    pub framerate: Option<u32>,
}

impl CaptureSettings {
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        match self.framerate {
            Some(fps) => {
                let resolution = self.preset.resolution();
                CaptureConfig::new(resolution.width, resolution.height, fps)
            }
            None => Ok(self.preset.config()),
        }
    }
}

/// Session controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Capacity of the engine event queue
    pub event_queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            event_queue_capacity: SessionController::DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}
