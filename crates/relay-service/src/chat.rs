//! Room chat validation and persistence seam.

use crate::errors::RelayError;
use async_trait::async_trait;
use common::types::RoomSlug;
use signaling_protocol::{ChatAuthor, ChatMessage};
use uuid::Uuid;

/// Longest accepted chat message, counted in characters before trimming.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 1000;

/// How far back a `reply_to` may point.
pub const REPLY_LOOKBACK: usize = 100;

/// Append-only chat storage.
#[async_trait]
pub trait PersistentChatLog: Send + Sync {
    /// Store a message and return it with its assigned ID and timestamp.
    async fn append(
        &self,
        room: &RoomSlug,
        author: ChatAuthor,
        text: String,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, RelayError>;

    /// Most recent messages, oldest first.
    async fn recent(&self, room: &RoomSlug, limit: usize) -> Result<Vec<ChatMessage>, RelayError>;
}

/// Validate chat text and return the trimmed body.
///
/// # Errors
///
/// `InvalidMessage` if the text is too long or blank.
pub fn validate_chat_text(text: &str) -> Result<String, RelayError> {
    if text.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return Err(RelayError::InvalidMessage(format!(
            "Message is too long (max {MAX_CHAT_MESSAGE_CHARS} characters)"
        )));
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidMessage(
            "Message cannot be empty".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

/// Check that `reply_to` names a recent message in the same room.
///
/// # Errors
///
/// `InvalidMessage` if the target is unknown; store failures pass through.
pub async fn check_reply_target(
    log: &dyn PersistentChatLog,
    room: &RoomSlug,
    reply_to: Uuid,
) -> Result<(), RelayError> {
    let recent = log.recent(room, REPLY_LOOKBACK).await?;
    if recent.iter().any(|m| m.id == reply_to) {
        Ok(())
    } else {
        Err(RelayError::InvalidMessage(
            "Reply target not found".to_string(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::UserId;

    #[test]
    fn test_text_is_trimmed() {
        assert_eq!(validate_chat_text("  hello \n").unwrap(), "hello");
    }

    #[test]
    fn test_blank_text_rejected() {
        let err = validate_chat_text("   \t").unwrap_err();
        assert_eq!(err.client_message(), "Message cannot be empty");
    }

    #[test]
    fn test_length_limit_counts_characters() {
        assert!(validate_chat_text(&"é".repeat(MAX_CHAT_MESSAGE_CHARS)).is_ok());

        let err = validate_chat_text(&"a".repeat(MAX_CHAT_MESSAGE_CHARS + 1)).unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(ref m) if m.contains("too long")));
    }

    struct OneMessageLog(ChatMessage);

    #[async_trait]
    impl PersistentChatLog for OneMessageLog {
        async fn append(
            &self,
            _room: &RoomSlug,
            _author: ChatAuthor,
            _text: String,
            _reply_to: Option<Uuid>,
        ) -> Result<ChatMessage, RelayError> {
            Ok(self.0.clone())
        }

        async fn recent(
            &self,
            _room: &RoomSlug,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, RelayError> {
            Ok(vec![self.0.clone()])
        }
    }

    #[tokio::test]
    async fn test_reply_target_lookup() {
        let room = RoomSlug::from("r1");
        let existing = ChatMessage {
            id: Uuid::new_v4(),
            room: room.clone(),
            text: "first".to_string(),
            created_at: chrono::Utc::now(),
            user: ChatAuthor {
                id: UserId::from("alice"),
                display_name: "Alice".to_string(),
                avatar_url: None,
            },
            reply_to: None,
        };
        let log = OneMessageLog(existing.clone());

        assert!(check_reply_target(&log, &room, existing.id).await.is_ok());
        assert!(matches!(
            check_reply_target(&log, &room, Uuid::new_v4()).await,
            Err(RelayError::InvalidMessage(_))
        ));
    }
}
