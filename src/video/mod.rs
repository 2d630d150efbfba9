//! Video capture module
//!
//! Capture sources hand encoded frames to the transport engine. Encoding
//! happens upstream; this module only describes, paces and carries frames.

pub mod capture;
pub mod format;
pub mod frame;
pub mod ivf;

pub use capture::{CaptureConfig, CapturePreset, CaptureSource, ChannelSource};
pub use format::{Resolution, VideoCodec};
pub use frame::VideoFrame;
pub use ivf::IvfFileSource;
