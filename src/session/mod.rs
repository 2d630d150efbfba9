//! Streaming session lifecycle
//!
//! [`SessionController`] owns one streaming attempt at a time and drives it
//! from `idle` through `connected`, `stopped` or `error`. [`SessionHost`] is
//! the long-lived control surface that presentation layers bind to.
//!
//! ```text
//! idle/stopped/error --start--> preparing --connection--> offering
//!     offering --gathering complete--> waiting_answer --connected--> connected
//!     any --stop--> stopped        any active --failure--> error
//! ```

pub mod controller;
pub mod host;

pub use controller::SessionController;
pub use host::SessionHost;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::video::CaptureConfig;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    /// Engine is being initialized and the connection created
    Preparing,
    /// Offer requested, candidates being gathered
    Offering,
    /// Offer published, waiting for the remote answer
    WaitingAnswer,
    Connected,
    Stopped,
    Error,
}

impl SessionState {
    /// Whether a session (and its engine) is alive in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Offering | Self::WaitingAnswer | Self::Connected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Offering => "offering",
            Self::WaitingAnswer => "waiting_answer",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one streaming attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session generation; 0 before the first start
    pub id: u64,
    pub state: SessionState,
    /// Capture config the session was started with
    pub config: Option<CaptureConfig>,
    /// Encoded offer blob, set once gathering completes
    pub local_offer: Option<String>,
    /// Applied answer description
    pub remote_answer: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Snapshot before any session has been started
    pub fn idle() -> Self {
        Self {
            id: 0,
            state: SessionState::Idle,
            config: None,
            local_offer: None,
            remote_answer: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn preparing(id: u64, config: CaptureConfig) -> Self {
        Self {
            id,
            state: SessionState::Preparing,
            config: Some(config),
            ..Self::idle()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::idle()
    }
}
