//! Relay to client events.

use crate::types::{ChatMessage, IceServer, MediaFlags, ParticipantSnapshot, SignalKind};
use common::types::{RoomSlug, UserId};
use serde::{Deserialize, Serialize};

/// Numeric error codes carried by [`ServerEvent::Error`].
pub mod error_codes {
    pub const UNAUTHORIZED: i32 = 2;
    pub const FORBIDDEN: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const INVALID_REQUEST: i32 = 5;
    pub const INTERNAL_ERROR: i32 = 6;
    pub const CAPACITY_EXCEEDED: i32 = 7;
}

/// A negotiation message relayed verbatim between two members of a room.
///
/// `from` is attached by the relay; clients cannot spoof it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub kind: SignalKind,
    pub from: UserId,
    pub to: UserId,
    pub room: RoomSlug,
    pub payload: serde_json::Value,
}

/// A frame sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
        ice_servers: Vec<IceServer>,
    },
    JoinResponse {
        room: RoomSlug,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Snapshot for the joiner. `participants` never contains the joiner.
    Joined {
        room: RoomSlug,
        local: ParticipantSnapshot,
        participants: Vec<ParticipantSnapshot>,
    },
    UserJoined {
        room: RoomSlug,
        participant: ParticipantSnapshot,
    },
    UserLeft {
        room: RoomSlug,
        user_id: UserId,
    },
    ControlChanged {
        room: RoomSlug,
        user_id: UserId,
        flags: MediaFlags,
    },
    /// Hint to the joiner listing the members it should start negotiating with.
    RequestOffers {
        room: RoomSlug,
        participants: Vec<ParticipantSnapshot>,
    },
    Kicked {
        room: RoomSlug,
    },
    HostChanged {
        room: RoomSlug,
        new_host_id: UserId,
        new_host_name: String,
    },
    Signal(RelayEnvelope),
    ChatResponse {
        room: RoomSlug,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<ChatMessage>,
    },
    ChatMessage {
        room: RoomSlug,
        message: ChatMessage,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomSlug>,
        code: i32,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Authenticated { .. } => "authenticated",
            ServerEvent::JoinResponse { .. } => "join_response",
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::ControlChanged { .. } => "control_changed",
            ServerEvent::RequestOffers { .. } => "request_offers",
            ServerEvent::Kicked { .. } => "kicked",
            ServerEvent::HostChanged { .. } => "host_changed",
            ServerEvent::Signal(_) => "signal",
            ServerEvent::ChatResponse { .. } => "chat_response",
            ServerEvent::ChatMessage { .. } => "chat_message",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong => "pong",
        }
    }

    /// Room this event belongs to, if any.
    #[must_use]
    pub fn room(&self) -> Option<&RoomSlug> {
        match self {
            ServerEvent::JoinResponse { room, .. }
            | ServerEvent::Joined { room, .. }
            | ServerEvent::UserJoined { room, .. }
            | ServerEvent::UserLeft { room, .. }
            | ServerEvent::ControlChanged { room, .. }
            | ServerEvent::RequestOffers { room, .. }
            | ServerEvent::Kicked { room }
            | ServerEvent::HostChanged { room, .. }
            | ServerEvent::ChatResponse { room, .. }
            | ServerEvent::ChatMessage { room, .. } => Some(room),
            ServerEvent::Signal(envelope) => Some(&envelope.room),
            ServerEvent::Error { room, .. } => room.as_ref(),
            ServerEvent::Authenticated { .. } | ServerEvent::Pong => None,
        }
    }

    /// Requester-only error frame.
    #[must_use]
    pub fn error(room: Option<RoomSlug>, code: i32, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            room,
            code,
            message: message.into(),
        }
    }
}
