//! Relay error types.
//!
//! Every error maps to a numeric code carried in `error` frames. Internal
//! details are logged server-side but never sent to clients; protocol errors
//! go only to the connection that caused them.

use signaling_protocol::error_codes;
use thiserror::Error;

/// Relay error type.
///
/// Maps to wire error codes:
/// - `Auth`, `Unauthenticated`: `UNAUTHORIZED` (2)
/// - `PasswordRequired`, `WrongPassword`, `NotHost`, `NotInRoom`: `FORBIDDEN` (3)
/// - `RoomNotFound`, `TargetNotFound`: `NOT_FOUND` (4)
/// - `InvalidMessage`: `INVALID_REQUEST` (5)
/// - `Redis`, `Config`, `Internal`: `INTERNAL_ERROR` (6)
/// - `RoomFull`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum RelayError {
    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential rejected. The payload is the internal reason.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A room operation arrived before `authenticate`.
    #[error("Connection is not authenticated")]
    Unauthenticated,

    /// Room slug is not in the directory.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Room is password protected and no password was supplied.
    #[error("Room password required")]
    PasswordRequired,

    /// Supplied password does not match the room.
    #[error("Wrong room password")]
    WrongPassword,

    /// Host-only action requested by a non-host.
    #[error("Requester is not the room host")]
    NotHost,

    /// Requester is not a member of the room (or its membership was replaced).
    #[error("Requester is not in the room")]
    NotInRoom,

    /// Target participant is not in the room.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// Room reached its participant limit.
    #[error("Room is full")]
    RoomFull,

    /// Frame failed validation. The payload is safe to show to the sender.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Relay is shutting down.
    #[error("Relay is draining")]
    Draining,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RelayError::Redis(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                error_codes::INTERNAL_ERROR
            }
            RelayError::Auth(_) | RelayError::Unauthenticated => error_codes::UNAUTHORIZED,
            RelayError::PasswordRequired
            | RelayError::WrongPassword
            | RelayError::NotHost
            | RelayError::NotInRoom => error_codes::FORBIDDEN,
            RelayError::RoomNotFound(_) | RelayError::TargetNotFound(_) => error_codes::NOT_FOUND,
            RelayError::InvalidMessage(_) => error_codes::INVALID_REQUEST,
            RelayError::RoomFull | RelayError::Draining => error_codes::CAPACITY_EXCEEDED,
        }
    }

    /// Returns the error code as a u16 (for the `status_code` metrics label).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        u16::try_from(self.error_code()).unwrap_or(0)
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            RelayError::Redis(_) => "redis",
            RelayError::Config(_) => "config",
            RelayError::Auth(_) => "auth",
            RelayError::Unauthenticated => "unauthenticated",
            RelayError::RoomNotFound(_) => "room_not_found",
            RelayError::PasswordRequired => "password_required",
            RelayError::WrongPassword => "wrong_password",
            RelayError::NotHost => "not_host",
            RelayError::NotInRoom => "not_in_room",
            RelayError::TargetNotFound(_) => "target_not_found",
            RelayError::RoomFull => "room_full",
            RelayError::InvalidMessage(_) => "invalid_message",
            RelayError::Draining => "draining",
            RelayError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Redis(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RelayError::Auth(_) => "Authentication failed".to_string(),
            RelayError::Unauthenticated => "Authentication required".to_string(),
            RelayError::RoomNotFound(_) => "Room not found".to_string(),
            RelayError::PasswordRequired => "Room password required".to_string(),
            RelayError::WrongPassword => "Wrong room password".to_string(),
            RelayError::NotHost => "Only the host can do that".to_string(),
            RelayError::NotInRoom => "You are not in this room".to_string(),
            RelayError::TargetNotFound(_) => "User not found".to_string(),
            RelayError::RoomFull => "Room is full".to_string(),
            RelayError::InvalidMessage(reason) => reason.clone(),
            RelayError::Draining => "Server is shutting down, please reconnect".to_string(),
        }
    }
}
