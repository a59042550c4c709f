//! Redis-backed session registry.

use super::client::RedisConnection;
use super::lua_scripts;
use crate::errors::RelayError;
use crate::observability::metrics::record_registry_latency;
use crate::registry::{ParticipantPatch, RegisteredParticipant, SessionRegistry};
use async_trait::async_trait;
use common::types::{RoomSlug, UserId};
use redis::Script;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

fn participant_key(room: &RoomSlug, user_id: &UserId) -> String {
    format!("participant:{room}:{user_id}")
}

fn participant_prefix(room: &RoomSlug) -> String {
    format!("participant:{room}:")
}

fn room_key(room: &RoomSlug) -> String {
    format!("room:{room}")
}

fn user_rooms_key(user_id: &UserId) -> String {
    format!("user-rooms:{user_id}")
}

/// [`SessionRegistry`] shared by every relay instance through Redis.
#[derive(Clone)]
pub struct RedisSessionRegistry {
    redis: RedisConnection,
    ttl_seconds: u64,
    upsert_script: Script,
    update_script: Script,
    refresh_script: Script,
    remove_script: Script,
    list_script: Script,
    rooms_for_user_script: Script,
}

impl RedisSessionRegistry {
    #[must_use]
    pub fn new(redis: RedisConnection, ttl: Duration) -> Self {
        Self {
            redis,
            ttl_seconds: ttl.as_secs().max(1),
            upsert_script: Script::new(lua_scripts::UPSERT),
            update_script: Script::new(lua_scripts::UPDATE_IF_PRESENT),
            refresh_script: Script::new(lua_scripts::REFRESH),
            remove_script: Script::new(lua_scripts::REMOVE),
            list_script: Script::new(lua_scripts::LIST),
            rooms_for_user_script: Script::new(lua_scripts::ROOMS_FOR_USER),
        }
    }
}

fn redis_error(operation: &'static str, room: &RoomSlug, e: &redis::RedisError) -> RelayError {
    warn!(
        target: "relay.redis.registry",
        error = %e,
        room = %room,
        operation = operation,
        "Registry operation failed"
    );
    RelayError::Redis(format!("Failed to {operation} participant: {e}"))
}

fn decode_record(raw: &str) -> Result<RegisteredParticipant, RelayError> {
    serde_json::from_str(raw).map_err(|e| {
        warn!(target: "relay.redis.registry", error = %e, "Stored participant record is invalid");
        RelayError::Internal(format!("Invalid participant record: {e}"))
    })
}

#[async_trait]
impl SessionRegistry for RedisSessionRegistry {
    #[instrument(skip_all, fields(room = %room))]
    async fn add_participant(
        &self,
        room: &RoomSlug,
        participant: RegisteredParticipant,
    ) -> Result<(), RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();
        let user_id = participant.user_id().clone();
        let record = serde_json::to_string(&participant)
            .map_err(|e| RelayError::Internal(format!("Failed to encode participant: {e}")))?;

        let _: i64 = self
            .upsert_script
            .key(participant_key(room, &user_id))
            .key(room_key(room))
            .key(user_rooms_key(&user_id))
            .arg(record)
            .arg(self.ttl_seconds)
            .arg(user_id.as_str())
            .arg(room.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("add", room, &e))?;

        record_registry_latency("add", start.elapsed());
        Ok(())
    }

    #[instrument(skip_all, fields(room = %room, user_id = %user_id))]
    async fn remove_participant(
        &self,
        room: &RoomSlug,
        user_id: &UserId,
    ) -> Result<bool, RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();

        let removed: i64 = self
            .remove_script
            .key(participant_key(room, user_id))
            .key(room_key(room))
            .key(user_rooms_key(user_id))
            .arg(user_id.as_str())
            .arg(room.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("remove", room, &e))?;

        record_registry_latency("remove", start.elapsed());
        Ok(removed > 0)
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn list_participants(
        &self,
        room: &RoomSlug,
    ) -> Result<Vec<RegisteredParticipant>, RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();

        let raw: Vec<String> = self
            .list_script
            .key(room_key(room))
            .arg(participant_prefix(room))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("list", room, &e))?;

        record_registry_latency("list", start.elapsed());
        raw.iter().map(|r| decode_record(r)).collect()
    }

    #[instrument(skip_all, fields(room = %room, user_id = %user_id))]
    async fn update_participant(
        &self,
        room: &RoomSlug,
        user_id: &UserId,
        patch: &ParticipantPatch,
    ) -> Result<Option<RegisteredParticipant>, RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();
        let patch = serde_json::to_string(patch)
            .map_err(|e| RelayError::Internal(format!("Failed to encode patch: {e}")))?;

        let merged: Option<String> = self
            .update_script
            .key(participant_key(room, user_id))
            .key(room_key(room))
            .key(user_rooms_key(user_id))
            .arg(patch)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("update", room, &e))?;

        record_registry_latency("update", start.elapsed());
        merged.as_deref().map(decode_record).transpose()
    }

    #[instrument(skip_all, fields(room = %room, user_id = %user_id))]
    async fn refresh(&self, room: &RoomSlug, user_id: &UserId) -> Result<bool, RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();

        let refreshed: i64 = self
            .refresh_script
            .key(participant_key(room, user_id))
            .key(room_key(room))
            .key(user_rooms_key(user_id))
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("refresh", room, &e))?;

        record_registry_latency("refresh", start.elapsed());
        Ok(refreshed == 1)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn rooms_for_user(&self, user_id: &UserId) -> Result<Vec<RoomSlug>, RelayError> {
        let start = Instant::now();
        let mut conn = self.redis.conn();

        let rooms: Vec<String> = self
            .rooms_for_user_script
            .key(user_rooms_key(user_id))
            .arg(user_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "relay.redis.registry",
                    error = %e,
                    user_id = %user_id,
                    "Failed to list rooms for user"
                );
                RelayError::Redis(format!("Failed to list rooms for user: {e}"))
            })?;

        record_registry_latency("rooms_for_user", start.elapsed());
        Ok(rooms.into_iter().map(RoomSlug::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_patterns() {
        let room = RoomSlug::from("standup");
        let user = UserId::from("alice");

        assert_eq!(participant_key(&room, &user), "participant:standup:alice");
        assert_eq!(room_key(&room), "room:standup");
        assert_eq!(user_rooms_key(&user), "user-rooms:alice");
    }

    #[test]
    fn test_prefix_matches_participant_key() {
        let room = RoomSlug::from("standup");
        let user = UserId::from("bob");
        assert_eq!(
            format!("{}{}", participant_prefix(&room), user),
            participant_key(&room, &user)
        );
    }
}
