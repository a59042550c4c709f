//! Message types for actor communication.
//!
//! All actor communication uses message passing via `tokio::sync::mpsc`
//! channels. Request-response patterns use `tokio::sync::oneshot` for the
//! response.

use crate::auth::Identity;
use crate::errors::RelayError;
use crate::registry::RegisteredParticipant;

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, RoomSlug, UserId};
use signaling_protocol::{ChatMessage, MediaFlags, MediaFlagsPatch, ServerEvent, SignalKind};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

// ============================================================================
// RelayControllerActor Messages
// ============================================================================

/// Messages sent to the `RelayControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Return the live room actor for a slug, spawning it if needed.
    GetOrCreateRoom {
        room: RoomSlug,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RelayError>>,
    },

    /// A room actor's delivery set became empty.
    RoomIdle {
        room: RoomSlug,
        /// Instance number of the reporting actor. Stale reports from a
        /// replaced actor are ignored.
        instance: u64,
    },

    /// Get current controller status.
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Stop accepting rooms and shut every room down.
    Shutdown {
        /// Maximum time to wait for rooms to finish.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Status information from the controller.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub active_rooms: usize,
    pub is_draining: bool,
    pub rooms: Vec<RoomSlug>,
}

// ============================================================================
// RoomActor Messages
// ============================================================================

/// Everything the room needs to admit a connection.
///
/// Room existence and the password have already been checked by the caller.
#[derive(Debug)]
pub struct JoinRequest {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    /// Outbound half of the joining connection.
    pub connection: ConnectionActorHandle,
    /// Initial media flags from the join message.
    pub flags: MediaFlags,
    /// True when the joiner is the directory host of the room.
    pub is_host: bool,
    /// Capacity from the room directory. Zero means unlimited.
    pub max_participants: u32,
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Admit a connection into the room.
    ///
    /// On success the room has already delivered `join-response`, `joined`
    /// and `request-offers` to the joiner.
    Join {
        request: Box<JoinRequest>,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Remove a member. Used by explicit leave and by disconnect cleanup.
    ///
    /// Only acts if `connection_id` still owns the membership.
    Leave {
        user_id: UserId,
        connection_id: ConnectionId,
        /// Whether a member was removed.
        respond_to: oneshot::Sender<bool>,
    },

    /// Relay an offer, answer or ICE candidate (fire-and-forget).
    Signal {
        from: UserId,
        connection_id: ConnectionId,
        to: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    },

    /// Update the sender's media flags.
    ControlUpdate {
        user_id: UserId,
        connection_id: ConnectionId,
        patch: MediaFlagsPatch,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Host removes a member.
    Kick {
        requester: UserId,
        connection_id: ConnectionId,
        target: UserId,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Host hands the host role to another member.
    TransferHost {
        requester: UserId,
        connection_id: ConnectionId,
        target: UserId,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Post a chat message to the room.
    Chat {
        author: Identity,
        connection_id: ConnectionId,
        text: String,
        reply_to: Option<Uuid>,
        respond_to: oneshot::Sender<Result<ChatMessage, RelayError>>,
    },

    /// Get current room state.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Stop the actor if nobody is in the room.
    ///
    /// Replies true when the actor is exiting.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },
}

/// Room state snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: RoomSlug,
    /// Members with a live connection on this relay.
    pub members: Vec<UserId>,
    /// Registry view of the room (may include members on other relays).
    pub participants: Vec<RegisteredParticipant>,
}

// ============================================================================
// ConnectionActor Messages
// ============================================================================

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Encode and write an event to the socket.
    Deliver { event: ServerEvent },

    /// Close the socket.
    Close { reason: String },
}

/// A frame handed to the socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}
