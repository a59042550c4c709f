//! Redis-backed room directory.
//!
//! Rooms live in a hash at `room-directory:{slug}` with fields `host_id`,
//! `password_hash` (absent or empty for open rooms) and `max_participants`.

use super::client::RedisConnection;
use crate::directory::{RoomDirectory, RoomRecord};
use crate::errors::RelayError;
use async_trait::async_trait;
use common::types::{RoomSlug, UserId};
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{instrument, warn};

/// Fallback when a room record has no usable `max_participants`.
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 10;

fn directory_key(room: &RoomSlug) -> String {
    format!("room-directory:{room}")
}

/// Build a [`RoomRecord`] from the hash fields. `None` if the hash is empty.
fn record_from_fields(fields: &HashMap<String, String>) -> Option<RoomRecord> {
    let host_id = fields.get("host_id").filter(|h| !h.is_empty())?;
    Some(RoomRecord {
        host_id: UserId::new(host_id.clone()),
        password_hash: fields
            .get("password_hash")
            .filter(|h| !h.is_empty())
            .cloned(),
        max_participants: fields
            .get("max_participants")
            .and_then(|s| s.parse().ok())
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS),
    })
}

#[derive(Clone)]
pub struct RedisRoomDirectory {
    redis: RedisConnection,
}

impl RedisRoomDirectory {
    #[must_use]
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RoomDirectory for RedisRoomDirectory {
    #[instrument(skip_all, fields(room = %room))]
    async fn find_by_slug(&self, room: &RoomSlug) -> Result<Option<RoomRecord>, RelayError> {
        let mut conn = self.redis.conn();
        let fields: HashMap<String, String> =
            conn.hgetall(directory_key(room)).await.map_err(|e| {
                warn!(target: "relay.redis.directory", error = %e, room = %room, "Failed to read room");
                RelayError::Redis(format!("Failed to read room: {e}"))
            })?;

        Ok(record_from_fields(&fields))
    }

    #[instrument(skip_all, fields(room = %room, new_host = %new_host))]
    async fn update_host(&self, room: &RoomSlug, new_host: &UserId) -> Result<(), RelayError> {
        let mut conn = self.redis.conn();
        let key = directory_key(room);

        let exists: bool = conn.exists(&key).await.map_err(|e| {
            warn!(target: "relay.redis.directory", error = %e, room = %room, "Failed to check room");
            RelayError::Redis(format!("Failed to check room: {e}"))
        })?;
        if !exists {
            return Err(RelayError::RoomNotFound(room.to_string()));
        }

        let _: i64 = conn
            .hset(&key, "host_id", new_host.as_str())
            .await
            .map_err(|e| {
                warn!(target: "relay.redis.directory", error = %e, room = %room, "Failed to update host");
                RelayError::Redis(format!("Failed to update host: {e}"))
            })?;
        Ok(())
    }
}
