//! Common error types for Doorline.

use thiserror::Error;

/// Result type alias using Doorline's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for configuration and wire handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
