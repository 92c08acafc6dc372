//! Error types for the spatial mesh engine
//!
//! Errors local to one peer session never cross the world boundary: they are
//! reflected in the session's state and emitted as events instead.

use thiserror::Error;

/// Error type for all engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Signaling delivery or protocol error (transient; delivery is
    /// at-least-once, so the engine does not retry)
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Negotiation did not reach a ready transport within the deadline
    #[error("Negotiation timed out for peer {0}")]
    NegotiationTimeout(String),

    /// Negotiation failed before the transport became ready
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Transport error after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),

    /// No usable audio listener context for this world
    #[error("Audio context unavailable: {0}")]
    AudioContextUnavailable(String),

    /// Peer has no active session
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Mesh is at its configured peer limit
    #[error("Maximum peers reached: {0}")]
    MaxPeersReached(u32),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Signal payload (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a signaling error
    pub fn signaling(msg: impl Into<String>) -> Self {
        Error::Signaling(msg.into())
    }

    /// Create a negotiation failure
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Error::NegotiationFailed(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::signaling("channel closed");
        assert_eq!(err.to_string(), "Signaling error: channel closed");

        let err = Error::NegotiationTimeout("peer-a".to_string());
        assert_eq!(err.to_string(), "Negotiation timed out for peer peer-a");
    }

    #[test]
    fn test_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Json(_)));
    }
}
