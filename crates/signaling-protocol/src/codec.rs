//! Frame encoding and decoding.
//!
//! Frames are size-checked before parsing. A frame that fails to decode is an
//! error for that frame only; callers drop it and keep the connection.

use crate::events::ServerEvent;
use crate::messages::ClientMessage;
use thiserror::Error;

/// Default upper bound on an inbound frame (64KB).
///
/// SDP offers with many candidates stay well under 16KB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Protocol-level decode and encode failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeds the configured size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// Frame is not valid JSON or not a known message.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Serialization failed.
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Decode one client frame.
///
/// # Errors
///
/// Returns `TooLarge` before any parsing when the frame exceeds `max_bytes`,
/// and `Malformed` when it is not a valid [`ClientMessage`].
pub fn decode_client_message(frame: &str, max_bytes: usize) -> Result<ClientMessage, ProtocolError> {
    if frame.len() > max_bytes {
        return Err(ProtocolError::TooLarge {
            size: frame.len(),
            max: max_bytes,
        });
    }

    serde_json::from_str(frame).map_err(|e| {
        tracing::debug!(target: "protocol.codec", error = %e, "Failed to decode client frame");
        ProtocolError::Malformed(e.to_string())
    })
}

/// Decode one relay frame (client side).
///
/// # Errors
///
/// Returns `Malformed` when the frame is not a valid [`ServerEvent`].
pub fn decode_server_event(frame: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(frame).map_err(|e| {
        tracing::debug!(target: "protocol.codec", error = %e, "Failed to decode relay frame");
        ProtocolError::Malformed(e.to_string())
    })
}

/// Encode a relay event as a text frame.
///
/// # Errors
///
/// Returns `Encode` if serialization fails.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encode a client message as a text frame.
///
/// # Errors
///
/// Returns `Encode` if serialization fails.
pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}
