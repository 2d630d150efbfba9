//! qrcast - one-way LAN video streaming over WebRTC
//!
//! The offer/answer handshake travels out of band as short text blobs
//! (QR code or clipboard). This crate provides the session state machine,
//! the signaling codec, the transport engine contract with a webrtc-rs
//! implementation, and the capture sources that feed it.

pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
