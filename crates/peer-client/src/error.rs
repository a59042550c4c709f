//! Peer client error types.

use signaling_protocol::ProtocolError;
use thiserror::Error;

/// Peer client error type.
///
/// Negotiation errors are recovered inside the link where possible; only
/// exhausted retries reach the application as `SessionNotice`s.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The underlying peer connection rejected an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A description or candidate could not be applied.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The link was closed before the operation completed.
    #[error("Link closed")]
    LinkClosed,

    /// Relay connection failed.
    #[error("Relay connection error: {0}")]
    Relay(String),

    /// The relay rejected our credential.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeerError {
    /// True if retrying the same operation later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, PeerError::Relay(_) | PeerError::Transport(_))
    }
}
