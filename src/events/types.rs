//! Session status event types
//!
//! Defines the events broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Session status event
///
/// Serialized with the event name as tag:
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "session_id": 1, "state": "waiting_answer", "status": "Offer ready, scan/paste answer" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// The session moved to a new state (one event per transition)
    #[serde(rename = "session.state_changed")]
    StateChanged {
        /// Session generation, 0 when no session was ever started
        session_id: u64,
        /// New state
        state: SessionState,
        /// Human-readable status line
        status: String,
    },

    /// Note that does not change state, e.g. a rejected answer
    #[serde(rename = "session.notice")]
    Notice {
        session_id: u64,
        message: String,
    },
}

impl SessionEvent {
    /// Event name, matching the serialized tag
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state_changed",
            Self::Notice { .. } => "session.notice",
        }
    }

    pub fn session_id(&self) -> u64 {
        match self {
            Self::StateChanged { session_id, .. } | Self::Notice { session_id, .. } => *session_id,
        }
    }

    /// Status text to show to the user
    pub fn message(&self) -> &str {
        match self {
            Self::StateChanged { status, .. } => status,
            Self::Notice { message, .. } => message,
        }
    }
}
