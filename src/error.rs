//! Error types for the live voice pipeline.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiveError {
    /// Microphone or speaker unavailable, or permission denied.
    #[error("Audio device error: {message}")]
    Device { message: String },

    /// Connect rejected or the session failed mid-stream.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed inbound audio payload.
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Transport session is not open")]
    NotConnected,

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Invalid session state: {message}")]
    InvalidState { message: String },
}

impl LiveError {
    pub fn device(message: impl Into<String>) -> Self {
        LiveError::Device {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        LiveError::Transport {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        LiveError::Decode {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        LiveError::Config {
            message: message.into(),
        }
    }

    /// Whether this error ends the live session.
    ///
    /// Decode and NotConnected errors drop the offending chunk or frame and
    /// the stream carries on.
    pub fn is_fatal(&self) -> bool {
        match self {
            LiveError::Device { .. } => true,
            LiveError::Transport { .. } => true,
            LiveError::Config { .. } => true,
            LiveError::Decode { .. } => false,
            LiveError::NotConnected => false,
            LiveError::InvalidState { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
