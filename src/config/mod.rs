//! Application configuration
//!
//! [`AppConfig`] is persisted as JSON in the data directory and cached by
//! [`ConfigStore`] for lock-free reads.

mod schema;
mod store;

pub use schema::{AppConfig, CaptureSettings, SessionSettings};
pub use store::{ConfigStore, CONFIG_FILE_NAME};
