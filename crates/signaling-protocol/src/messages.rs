//! Client to relay messages.

use crate::types::{MediaFlagsPatch, SignalKind};
use common::types::{RoomSlug, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A frame sent by a client.
///
/// `authenticate` must be the first message on a connection; anything else
/// before it is answered with an unauthorized error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    Join {
        room: RoomSlug,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        muted: bool,
        #[serde(default)]
        camera_off: bool,
    },
    Leave {
        room: RoomSlug,
    },
    /// Offer, answer or ICE candidate addressed to one member of the room.
    Signal {
        room: RoomSlug,
        to: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    },
    ControlUpdate {
        room: RoomSlug,
        #[serde(flatten)]
        patch: MediaFlagsPatch,
    },
    Kick {
        room: RoomSlug,
        target: UserId,
    },
    TransferHost {
        room: RoomSlug,
        target: UserId,
    },
    ChatSend {
        room: RoomSlug,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<Uuid>,
    },
    Ping,
}

impl ClientMessage {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::ControlUpdate { .. } => "control_update",
            ClientMessage::Kick { .. } => "kick",
            ClientMessage::TransferHost { .. } => "transfer_host",
            ClientMessage::ChatSend { .. } => "chat_send",
            ClientMessage::Ping => "ping",
        }
    }

    /// Room this message targets, if any.
    #[must_use]
    pub fn room(&self) -> Option<&RoomSlug> {
        match self {
            ClientMessage::Join { room, .. }
            | ClientMessage::Leave { room }
            | ClientMessage::Signal { room, .. }
            | ClientMessage::ControlUpdate { room, .. }
            | ClientMessage::Kick { room, .. }
            | ClientMessage::TransferHost { room, .. }
            | ClientMessage::ChatSend { room, .. } => Some(room),
            ClientMessage::Authenticate { .. } | ClientMessage::Ping => None,
        }
    }
}
