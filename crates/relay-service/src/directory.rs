//! Room directory lookups and join access checks.
//!
//! Rooms are created elsewhere; the relay only reads their host, password
//! hash and capacity, and persists host transfers.

use crate::errors::RelayError;
use async_trait::async_trait;
use common::types::{RoomSlug, UserId};
use std::fmt;

/// Directory entry for one room.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomRecord {
    /// Authoritative host. Host-only actions are checked against this value.
    pub host_id: UserId,
    /// bcrypt hash; `None` for rooms without a password.
    pub password_hash: Option<String>,
    pub max_participants: u32,
}

impl fmt::Debug for RoomRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomRecord")
            .field("host_id", &self.host_id)
            .field(
                "password_hash",
                &self.password_hash.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_participants", &self.max_participants)
            .finish()
    }
}

/// Read/update access to the room directory.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_by_slug(&self, room: &RoomSlug) -> Result<Option<RoomRecord>, RelayError>;

    /// Persist a new host. Fails with `RoomNotFound` if the room is gone.
    async fn update_host(&self, room: &RoomSlug, new_host: &UserId) -> Result<(), RelayError>;
}

/// Check a join password against the room record.
///
/// Password verification is CPU-bound and runs on the blocking pool.
///
/// # Errors
///
/// - `PasswordRequired` if the room has a password and none (or an empty one) was given
/// - `WrongPassword` if the password does not match
/// - `Internal` if the stored hash is unusable
pub async fn check_room_access(
    record: &RoomRecord,
    password: Option<&str>,
) -> Result<(), RelayError> {
    let Some(hash) = record.password_hash.clone() else {
        return Ok(());
    };

    let Some(password) = password.filter(|p| !p.is_empty()).map(str::to_string) else {
        return Err(RelayError::PasswordRequired);
    };

    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| RelayError::Internal(format!("password check task failed: {e}")))?
        .map_err(|e| {
            tracing::warn!(target: "relay.directory", error = %e, "Stored room password hash is invalid");
            RelayError::Internal(format!("password hash verification failed: {e}"))
        })?;

    if matches {
        Ok(())
    } else {
        Err(RelayError::WrongPassword)
    }
}
