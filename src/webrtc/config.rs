//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WebRTC transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Gather only IPv4 candidates
    pub ipv4_only: bool,
    /// Upper bound on candidate gathering before the offer is published (ms)
    pub gathering_timeout_ms: u64,
    /// Track ID of the outgoing video track
    pub track_id: String,
    /// Stream ID of the outgoing video track
    pub stream_id: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on a LAN; add STUN/TURN for anything else
            stun_servers: vec![],
            turn_servers: vec![],
            ipv4_only: true,
            gathering_timeout_ms: 10_000,
            track_id: "screen".to_string(),
            stream_id: "qrcast".to_string(),
        }
    }
}

impl WebRtcConfig {
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g. "turn:turn.example.com:3478?transport=udp")
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}
