use thiserror::Error;

use crate::webrtc::signaling::SignalKind;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Validation error: expected {expected} message, got {found}")]
    ValidationError {
        expected: SignalKind,
        found: SignalKind,
    },

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("No active session controller")]
    NotBound,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Short failure category used in human-readable status strings
    pub fn category(&self) -> &'static str {
        match self {
            AppError::DecodeError(_) => "decode",
            AppError::ValidationError { .. } => "validation",
            AppError::EngineFailure(_) => "engine",
            AppError::NotBound => "not bound",
            AppError::InvalidState(_) => "state",
            AppError::InvalidConfig(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
