//! WebRTC transport for one-way video streaming
//!
//! The session controller talks to the transport through the
//! [`TransportEngine`] contract. [`WebRtcEngine`] implements it with
//! webrtc-rs: a send-only video track fed by a capture source, candidate
//! gathering completed before the offer is published, and no trickle ICE.
//!
//! Signaling is out of band:
//! ```text
//! Sender                                   Receiver
//!   | create offer, gather all candidates     |
//!   | encode(offer) ---- QR / clipboard ----> |
//!   |                                         | decode, create answer
//!   | <--- QR / clipboard ---- encode(answer) |
//!   | decode, apply answer                    |
//!   |========== ICE / DTLS / SRTP video =====>|
//! ```

pub mod config;
pub mod engine;
pub mod mdns;
pub mod peer;
pub mod signaling;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use engine::{
    ConnectionState, EngineEvent, EngineFactory, EventSink, SessionEnvelope, TransportEngine,
};
pub use peer::{WebRtcEngine, WebRtcEngineFactory};
pub use signaling::{SignalKind, SignalMessage};
pub use track::VideoTrack;
