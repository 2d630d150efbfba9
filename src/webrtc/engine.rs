//! Transport engine capability contract
//!
//! The session controller drives the underlying connection library only
//! through [`TransportEngine`]. Asynchronous notifications flow back through
//! an [`EventSink`] that tags every event with the session it belongs to, so
//! the controller can drop events from a superseded session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::video::{CaptureConfig, CaptureSource};

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Events pushed asynchronously by a transport engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Candidate gathering finished; carries the complete local description
    GatheringComplete(String),
    /// Peer connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Fatal transport/device/codec failure
    Failure(String),
}

/// An engine event scoped to the session that produced it
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
    pub session_id: u64,
    pub event: EngineEvent,
}

/// Sending half of the controller's event queue, bound to one session
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: u64,
    tx: mpsc::Sender<SessionEnvelope>,
}

impl EventSink {
    pub fn new(session_id: u64, tx: mpsc::Sender<SessionEnvelope>) -> Self {
        Self { session_id, tx }
    }

    /// Session this sink reports for
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Queue an event, waiting for room if the queue is full
    ///
    /// Events sent after the controller is gone are dropped.
    pub async fn send(&self, event: EngineEvent) {
        let envelope = SessionEnvelope {
            session_id: self.session_id,
            event,
        };
        if self.tx.send(envelope).await.is_err() {
            debug!("Event queue closed, dropping event for session {}", self.session_id);
        }
    }
}

/// Capability surface of the media transport engine
///
/// Every call may fail with [`crate::AppError::EngineFailure`]; the
/// controller maps such failures to the error state and never retries.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Prepare codec and transport resources. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Create the connection and attach `source` to an outgoing video track.
    ///
    /// The engine owns `source` from here on and releases it in
    /// [`teardown`](Self::teardown). `sink` receives all asynchronous events.
    async fn create_connection(
        &self,
        config: CaptureConfig,
        source: Box<dyn CaptureSource>,
        sink: EventSink,
    ) -> Result<()>;

    /// Start offer generation.
    ///
    /// Returns once the local description is set; `GatheringComplete` is
    /// delivered through the sink after every candidate has been gathered.
    async fn create_offer(&self) -> Result<()>;

    /// Current local session description, if any
    async fn current_local_description(&self) -> Option<String>;

    /// Apply the remote answer description
    async fn apply_remote_answer(&self, sdp: String) -> Result<()>;

    /// Release capture source, track and connection. Safe to call repeatedly.
    async fn teardown(&self);
}

/// Creates one fresh engine per session
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self) -> Arc<dyn TransportEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Arc<dyn TransportEngine> + Send + Sync,
{
    fn create_engine(&self) -> Arc<dyn TransportEngine> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_session() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(7, tx);
        assert_eq!(sink.session_id(), 7);

        sink.send(EngineEvent::GatheringComplete("v=0".into())).await;
        sink.send(EngineEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session_id, 7);
        assert_eq!(first.event, EngineEvent::GatheringComplete("v=0".into()));

        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.event,
            EngineEvent::ConnectionStateChanged(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_sink_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Must not panic or hang
        EventSink::new(1, tx)
            .send(EngineEvent::Failure("gone".into()))
            .await;
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
