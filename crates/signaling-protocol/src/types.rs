//! Value types carried inside protocol frames.

use chrono::{DateTime, Utc};
use common::types::{RoomSlug, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a relayed negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// Media state of one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFlags {
    pub muted: bool,
    pub camera_off: bool,
    pub screen_sharing: bool,
}

impl MediaFlags {
    /// Apply a partial update, leaving absent fields untouched.
    #[must_use]
    pub fn apply(self, patch: &MediaFlagsPatch) -> Self {
        Self {
            muted: patch.muted.unwrap_or(self.muted),
            camera_off: patch.camera_off.unwrap_or(self.camera_off),
            screen_sharing: patch.screen_sharing.unwrap_or(self.screen_sharing),
        }
    }
}

/// Partial media state update. `None` fields are left as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFlagsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_off: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_sharing: Option<bool>,
}

impl MediaFlagsPatch {
    /// True if the patch would not change anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.muted.is_none() && self.camera_off.is_none() && self.screen_sharing.is_none()
    }
}

/// A participant as seen by other members of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub camera_off: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub is_host: bool,
}

impl ParticipantSnapshot {
    /// Current media flags of this participant.
    #[must_use]
    pub fn flags(&self) -> MediaFlags {
        MediaFlags {
            muted: self.muted,
            camera_off: self.camera_off,
            screen_sharing: self.screen_sharing,
        }
    }

    /// Overwrite the media flags of this participant.
    pub fn set_flags(&mut self, flags: MediaFlags) {
        self.muted = flags.muted;
        self.camera_off = flags.camera_off;
        self.screen_sharing = flags.screen_sharing;
    }
}

/// ICE server entry handed to clients after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Author block of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAuthor {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room: RoomSlug,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub user: ChatAuthor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_flags_apply_keeps_absent_fields() {
        let flags = MediaFlags {
            muted: true,
            camera_off: false,
            screen_sharing: false,
        };
        let patch = MediaFlagsPatch {
            camera_off: Some(true),
            ..MediaFlagsPatch::default()
        };

        let updated = flags.apply(&patch);
        assert!(updated.muted);
        assert!(updated.camera_off);
        assert!(!updated.screen_sharing);
    }

    #[test]
    fn test_empty_patch() {
        assert!(MediaFlagsPatch::default().is_empty());
        assert!(!MediaFlagsPatch {
            muted: Some(false),
            ..MediaFlagsPatch::default()
        }
        .is_empty());
    }

    #[test]
    fn test_signal_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(SignalKind::Offer.as_str(), "offer");
    }

    #[test]
    fn test_participant_snapshot_defaults_missing_flags() {
        let json = r#"{"user_id":"u1","display_name":"Ada"}"#;
        let snapshot: ParticipantSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.flags(), MediaFlags::default());
        assert!(!snapshot.is_host);
        assert!(snapshot.avatar_url.is_none());
    }
}
