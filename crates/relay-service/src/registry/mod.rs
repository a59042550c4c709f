//! Session registry.
//!
//! Ephemeral per-room participant store. Records are keyed by
//! `(room, user_id)` so concurrent joins to one room never overwrite each
//! other, and every write refreshes the record's TTL. TTL expiry is only a
//! safety net for relays that died without cleaning up; the normal removal
//! path is leave, disconnect or kick.
//!
//! Two backends implement [`SessionRegistry`]:
//!
//! - [`InMemoryRegistry`] for single-instance deployments and tests
//! - [`crate::redis::RedisSessionRegistry`] for shared state across relays

mod memory;

pub use memory::InMemoryRegistry;

use crate::errors::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, RoomSlug, UserId};
use serde::{Deserialize, Serialize};
use signaling_protocol::{MediaFlagsPatch, ParticipantSnapshot};

/// A participant record as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredParticipant {
    #[serde(flatten)]
    pub snapshot: ParticipantSnapshot,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
}

impl RegisteredParticipant {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.snapshot.user_id
    }

    /// Apply a patch in place.
    pub fn apply(&mut self, patch: &ParticipantPatch) {
        let flags = self.snapshot.flags().apply(&patch.flags);
        self.snapshot.set_flags(flags);
        if let Some(is_host) = patch.is_host {
            self.snapshot.is_host = is_host;
        }
    }
}

/// Partial update of a participant record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantPatch {
    #[serde(flatten)]
    pub flags: MediaFlagsPatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_host: Option<bool>,
}

impl ParticipantPatch {
    #[must_use]
    pub fn host(is_host: bool) -> Self {
        Self {
            flags: MediaFlagsPatch::default(),
            is_host: Some(is_host),
        }
    }

    #[must_use]
    pub fn media(flags: MediaFlagsPatch) -> Self {
        Self {
            flags,
            is_host: None,
        }
    }
}

/// Per-room participant store with TTL-bounded records.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Idempotent upsert. Refreshes the TTL.
    async fn add_participant(
        &self,
        room: &RoomSlug,
        participant: RegisteredParticipant,
    ) -> Result<(), RelayError>;

    /// Remove a participant. Deletes the room record once it is empty.
    ///
    /// Returns whether a record was removed.
    async fn remove_participant(&self, room: &RoomSlug, user_id: &UserId)
        -> Result<bool, RelayError>;

    /// Current participants of a room, in no particular order.
    async fn list_participants(
        &self,
        room: &RoomSlug,
    ) -> Result<Vec<RegisteredParticipant>, RelayError>;

    /// Merge a patch into an existing record and refresh its TTL.
    ///
    /// Returns `None` without writing anything if the participant is absent,
    /// so a late update can never resurrect a removed record.
    async fn update_participant(
        &self,
        room: &RoomSlug,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<Option<RegisteredParticipant>, RelayError>;

    /// Extend the TTL of an existing record. Returns false if absent.
    async fn refresh(&self, room: &RoomSlug, user_id: &UserId) -> Result<bool, RelayError>;

    /// Rooms the user currently has a record in.
    async fn rooms_for_user(&self, user_id: &UserId) -> Result<Vec<RoomSlug>, RelayError>;
}
