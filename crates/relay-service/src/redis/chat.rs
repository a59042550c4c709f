//! Redis-backed chat log.
//!
//! Messages are JSON entries in a capped list at `chat:{slug}`, newest first.

use super::client::RedisConnection;
use crate::chat::PersistentChatLog;
use crate::errors::RelayError;
use async_trait::async_trait;
use chrono::Utc;
use common::types::RoomSlug;
use redis::AsyncCommands;
use signaling_protocol::{ChatAuthor, ChatMessage};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Messages kept per room.
pub const CHAT_HISTORY_LIMIT: isize = 500;

fn chat_key(room: &RoomSlug) -> String {
    format!("chat:{room}")
}

#[derive(Clone)]
pub struct RedisChatLog {
    redis: RedisConnection,
}

impl RedisChatLog {
    #[must_use]
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PersistentChatLog for RedisChatLog {
    #[instrument(skip_all, fields(room = %room))]
    async fn append(
        &self,
        room: &RoomSlug,
        author: ChatAuthor,
        text: String,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, RelayError> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room: room.clone(),
            text,
            created_at: Utc::now(),
            user: author,
            reply_to,
        };
        let encoded = serde_json::to_string(&message)
            .map_err(|e| RelayError::Internal(format!("Failed to encode chat message: {e}")))?;

        let mut conn = self.redis.conn();
        let key = chat_key(room);
        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, encoded)
            .ignore()
            .ltrim(&key, 0, CHAT_HISTORY_LIMIT - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "relay.redis.chat", error = %e, room = %room, "Failed to store chat message");
                RelayError::Redis(format!("Failed to store chat message: {e}"))
            })?;

        Ok(message)
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn recent(&self, room: &RoomSlug, limit: usize) -> Result<Vec<ChatMessage>, RelayError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(CHAT_HISTORY_LIMIT) - 1;

        let mut conn = self.redis.conn();
        let raw: Vec<String> = conn.lrange(chat_key(room), 0, stop).await.map_err(|e| {
            warn!(target: "relay.redis.chat", error = %e, room = %room, "Failed to read chat history");
            RelayError::Redis(format!("Failed to read chat history: {e}"))
        })?;

        // Stored newest first; skip entries that no longer decode.
        Ok(raw
            .iter()
            .rev()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_key() {
        assert_eq!(chat_key(&RoomSlug::from("r1")), "chat:r1");
    }
}
