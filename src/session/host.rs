//! Long-lived control surface for presentation layers
//!
//! The host outlives any UI. Presentation code binds a controller once and
//! issues commands through the host; while nothing is bound every command
//! fails with [`AppError::NotBound`] and a status notice.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::controller::{SessionController, STATUS_NOT_BOUND};
use super::Session;
use crate::config::CaptureSettings;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::video::{CaptureConfig, CapturePreset, CaptureSource};

pub struct SessionHost {
    controller: RwLock<Option<Arc<SessionController>>>,
    capture: RwLock<CaptureSettings>,
    events: Arc<EventBus>,
    /// Snapshot source while unbound
    idle_tx: watch::Sender<Session>,
}

impl SessionHost {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (idle_tx, _) = watch::channel(Session::idle());
        Self {
            controller: RwLock::new(None),
            capture: RwLock::new(CaptureSettings::default()),
            events,
            idle_tx,
        }
    }

    /// Attach a controller, stopping any previously bound one
    pub fn bind(&self, controller: Arc<SessionController>) {
        let previous = self.controller.write().replace(controller);
        if let Some(previous) = previous {
            warn!("Replacing bound session controller");
            previous.stop();
        }
        info!("Session controller bound");
    }

    /// Detach the controller and hand it back to the caller
    pub fn unbind(&self) -> Option<Arc<SessionController>> {
        let controller = self.controller.write().take();
        if controller.is_some() {
            info!("Session controller unbound");
        }
        controller
    }

    pub fn is_bound(&self) -> bool {
        self.controller.read().is_some()
    }

    /// Select the capture preset used by the next start
    pub fn set_preset(&self, preset: CapturePreset) {
        debug!("Capture preset set to {}", preset);
        self.capture.write().preset = preset;
    }

    pub fn preset(&self) -> CapturePreset {
        self.capture.read().preset
    }

    /// Override the preset frame rate for the next start
    pub fn set_framerate(&self, framerate: Option<u32>) {
        self.capture.write().framerate = framerate;
    }

    /// Replace preset and frame rate from stored settings
    pub fn apply_settings(&self, settings: &CaptureSettings) {
        *self.capture.write() = settings.clone();
    }

    /// Capture config the next start will use
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        self.capture.read().capture_config()
    }

    /// Start a session with the current preset
    pub fn start(&self, source: Box<dyn CaptureSource>) -> Result<u64> {
        let controller = self.bound()?;
        let config = self.capture_config()?;
        controller.start(config, source)
    }

    pub fn apply_answer(&self, text: &str) -> Result<()> {
        self.bound()?.apply_answer(text)
    }

    pub fn stop(&self) -> Result<()> {
        self.bound()?.stop();
        Ok(())
    }

    /// Stop the bound controller and wait for its engine to be released
    pub async fn shutdown(&self) {
        let controller = self.controller.read().clone();
        if let Some(controller) = controller {
            controller.shutdown().await;
        }
    }

    /// Watch session snapshots
    ///
    /// While unbound this yields a receiver stuck at the idle snapshot;
    /// call again after binding.
    pub fn observe_state(&self) -> watch::Receiver<Session> {
        match self.controller.read().as_ref() {
            Some(controller) => controller.subscribe(),
            None => self.idle_tx.subscribe(),
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn bound(&self) -> Result<Arc<SessionController>> {
        let controller = self.controller.read().clone();
        controller.ok_or_else(|| {
            self.events.publish(SessionEvent::Notice {
                session_id: 0,
                message: STATUS_NOT_BOUND.to_string(),
            });
            AppError::NotBound
        })
    }
}
