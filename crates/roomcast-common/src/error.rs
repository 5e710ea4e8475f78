//! Common error types for Roomcast.

use thiserror::Error;

/// Result type alias using Roomcast's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Roomcast operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Signaling transport error (WebSocket closed, send failed, ...)
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Peer connection / negotiation error
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Local media capture rejected or unavailable
    #[error("capture error: {0}")]
    Capture(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a capture error from any displayable type.
    pub fn capture(msg: impl std::fmt::Display) -> Self {
        Self::Capture(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
