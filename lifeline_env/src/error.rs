//! Error types for the Lifeline environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Socket open/send failed (refused, reset, closed)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The access token collaborator could not produce a credential
    #[error("Token unavailable: {0}")]
    TokenUnavailable(String),

    /// IP-based geolocation lookup failed
    #[error("Locate failed: {0}")]
    LocateFailed(String),

    /// Frame serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a token error.
    pub fn token(msg: impl Into<String>) -> Self {
        Self::TokenUnavailable(msg.into())
    }

    /// Creates a locate error.
    pub fn locate(msg: impl Into<String>) -> Self {
        Self::LocateFailed(msg.into())
    }

    /// True for failures that a reconnect can recover from.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::SerializationError(_))
    }
}
