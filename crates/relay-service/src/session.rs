//! Per-connection relay session.
//!
//! `RelaySession` is the inbound half of one WebSocket. It decodes client
//! frames, enforces Unauthenticated → Authenticated → Joined(rooms), and
//! turns room operations into messages for the right `RoomActor`.
//!
//! Protocol errors are reported only to this connection:
//!
//! - failed joins as `join-response {success: false}`
//! - failed chat sends as `chat-response {success: false}`
//! - everything else as `error {room?, code, message}`
//!
//! A malformed frame is answered and dropped; the connection stays open.

use crate::actors::{ConnectionActorHandle, JoinRequest, RelayControllerHandle, RoomActorHandle};
use crate::actors::ActorMetrics;
use crate::auth::{CredentialValidator, Identity};
use crate::directory::{check_room_access, RoomDirectory};
use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::registry::SessionRegistry;

use common::types::{ConnectionId, RoomSlug, UserId};
use signaling_protocol::{
    decode_client_message, error_codes, ClientMessage, IceServer, MediaFlags, ProtocolError,
    ServerEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Shared dependencies of every session on this relay.
pub struct RelayContext {
    pub controller: RelayControllerHandle,
    pub validator: Arc<dyn CredentialValidator>,
    pub directory: Arc<dyn RoomDirectory>,
    /// Same registry the room actors write; disconnect sweeps it for records
    /// a vanished room actor never removed.
    pub registry: Arc<dyn SessionRegistry>,
    pub metrics: Arc<ActorMetrics>,
    /// Returned to clients in `authenticated`.
    pub ice_servers: Vec<IceServer>,
    pub max_message_bytes: usize,
    /// How long a new socket may stay unauthenticated.
    pub auth_timeout: Duration,
}

/// What the socket loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Close,
}

#[derive(Debug)]
enum SessionState {
    Unauthenticated,
    Authenticated(Identity),
}

/// Inbound state machine of one connection.
pub struct RelaySession {
    context: Arc<RelayContext>,
    connection: ConnectionActorHandle,
    state: SessionState,
    joined: HashMap<RoomSlug, RoomActorHandle>,
}

impl RelaySession {
    #[must_use]
    pub fn new(context: Arc<RelayContext>, connection: ConnectionActorHandle) -> Self {
        Self {
            context,
            connection,
            state: SessionState::Unauthenticated,
            joined: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        match &self.state {
            SessionState::Authenticated(identity) => Some(&identity.user_id),
            SessionState::Unauthenticated => None,
        }
    }

    /// Rooms this connection is currently joined to.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomSlug> {
        let mut rooms: Vec<RoomSlug> = self.joined.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Handle one text frame from the client.
    #[instrument(skip_all, fields(connection_id = %self.connection.connection_id()))]
    pub async fn handle_frame(&mut self, frame: &str) -> SessionControl {
        let message = match decode_client_message(frame, self.context.max_message_bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "relay.session",
                    connection_id = %self.connection.connection_id(),
                    error = %e,
                    "Dropping undecodable frame"
                );
                let reason = match e {
                    ProtocolError::TooLarge { .. } => "Message too large",
                    ProtocolError::Malformed(_) | ProtocolError::Encode(_) => "Invalid message",
                };
                prom::record_error("decode", "invalid_message", 5);
                self.send_error(None, error_codes::INVALID_REQUEST, reason);
                return SessionControl::Continue;
            }
        };

        let message_type = message.message_type();
        let start = Instant::now();
        let control = self.handle_message(message).await;
        prom::record_message(message_type);
        prom::record_message_latency(message_type, start.elapsed());
        control
    }

    /// Reject a binary frame. The protocol is text-only.
    pub fn reject_binary(&self) {
        prom::record_error("decode", "invalid_message", 5);
        self.send_error(None, error_codes::INVALID_REQUEST, "Binary frames are not supported");
    }

    async fn handle_message(&mut self, message: ClientMessage) -> SessionControl {
        let identity = match &self.state {
            SessionState::Authenticated(identity) => Some(identity.clone()),
            SessionState::Unauthenticated => None,
        };

        match (message, identity) {
            (ClientMessage::Ping, _) => {
                self.connection.deliver(ServerEvent::Pong);
                SessionControl::Continue
            }
            (ClientMessage::Authenticate { token }, None) => self.authenticate(&token).await,
            (ClientMessage::Authenticate { .. }, Some(_)) => {
                self.send_error(None, error_codes::INVALID_REQUEST, "Already authenticated");
                SessionControl::Continue
            }
            (other, None) => {
                let error = RelayError::Unauthenticated;
                prom::record_error(
                    other.message_type(),
                    error.error_type_label(),
                    error.status_code(),
                );
                self.send_error(
                    other.room().cloned(),
                    error.error_code(),
                    error.client_message(),
                );
                SessionControl::Continue
            }
            (other, Some(identity)) => {
                self.handle_room_message(&identity, other).await;
                SessionControl::Continue
            }
        }
    }

    async fn authenticate(&mut self, token: &str) -> SessionControl {
        match self.context.validator.verify(token).await {
            Ok(identity) => {
                prom::record_auth("success");
                info!(
                    target: "relay.session",
                    connection_id = %self.connection.connection_id(),
                    user_id = %identity.user_id,
                    "Connection authenticated"
                );
                self.connection.deliver(ServerEvent::Authenticated {
                    user_id: identity.user_id.clone(),
                    ice_servers: self.context.ice_servers.clone(),
                });
                self.state = SessionState::Authenticated(identity);
                SessionControl::Continue
            }
            Err(e) => {
                prom::record_auth("failure");
                prom::record_error("authenticate", e.error_type_label(), e.status_code());
                self.send_error(None, e.error_code(), e.client_message());
                // Queued behind the error frame, so the client sees why.
                let _ = self.connection.close("Authentication failed").await;
                SessionControl::Close
            }
        }
    }

    async fn handle_room_message(&mut self, identity: &Identity, message: ClientMessage) {
        let operation = message.message_type();
        let Some(room) = message.room().cloned() else {
            return;
        };

        let result = match message {
            ClientMessage::Join {
                room,
                password,
                muted,
                camera_off,
            } => {
                let flags = MediaFlags {
                    muted,
                    camera_off,
                    screen_sharing: false,
                };
                self.join(identity, room, password, flags).await
            }
            ClientMessage::Leave { room } => self.leave(identity, &room).await,
            ClientMessage::Signal {
                room,
                to,
                kind,
                payload,
            } => match self.joined_room(&room) {
                Ok(handle) => {
                    handle
                        .signal(
                            identity.user_id.clone(),
                            self.connection.connection_id(),
                            to,
                            kind,
                            payload,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            ClientMessage::ControlUpdate { room, patch } => match self.joined_room(&room) {
                Ok(handle) => {
                    handle
                        .control_update(
                            identity.user_id.clone(),
                            self.connection.connection_id(),
                            patch,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            ClientMessage::Kick { room, target } => match self.joined_room(&room) {
                Ok(handle) => {
                    handle
                        .kick(
                            identity.user_id.clone(),
                            self.connection.connection_id(),
                            target,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            ClientMessage::TransferHost { room, target } => match self.joined_room(&room) {
                Ok(handle) => {
                    handle
                        .transfer_host(
                            identity.user_id.clone(),
                            self.connection.connection_id(),
                            target,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            ClientMessage::ChatSend {
                room,
                text,
                reply_to,
            } => match self.joined_room(&room) {
                Ok(handle) => handle
                    .chat(
                        identity.clone(),
                        self.connection.connection_id(),
                        text,
                        reply_to,
                    )
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            ClientMessage::Authenticate { .. } | ClientMessage::Ping => Ok(()),
        };

        if let Err(e) = result {
            self.report_error(operation, room, &e);
        }
    }

    async fn join(
        &mut self,
        identity: &Identity,
        room: RoomSlug,
        password: Option<String>,
        flags: MediaFlags,
    ) -> Result<(), RelayError> {
        let record = self
            .context
            .directory
            .find_by_slug(&room)
            .await?
            .ok_or_else(|| RelayError::RoomNotFound(room.to_string()))?;
        check_room_access(&record, password.as_deref()).await?;

        let request = || JoinRequest {
            identity: identity.clone(),
            connection_id: self.connection.connection_id(),
            connection: self.connection.clone(),
            flags,
            is_host: record.host_id == identity.user_id,
            max_participants: record.max_participants,
        };

        let mut handle = self.context.controller.get_or_create_room(room.clone()).await?;
        let first_attempt = handle.join(request()).await;
        let result = match first_attempt {
            // The room stopped between lookup and join; a fresh actor takes over.
            Err(_) if handle.is_closed() => {
                debug!(
                    target: "relay.session",
                    room = %room,
                    "Room actor stopped during join, retrying"
                );
                handle = self.context.controller.get_or_create_room(room.clone()).await?;
                handle.join(request()).await
            }
            other => other,
        };
        result?;

        self.joined.insert(room, handle);
        Ok(())
    }

    async fn leave(&mut self, identity: &Identity, room: &RoomSlug) -> Result<(), RelayError> {
        let Some(handle) = self.joined.remove(room) else {
            return Ok(());
        };
        if handle.is_closed() {
            return Ok(());
        }
        handle
            .leave(identity.user_id.clone(), self.connection.connection_id())
            .await?;
        Ok(())
    }

    fn joined_room(&self, room: &RoomSlug) -> Result<RoomActorHandle, RelayError> {
        match self.joined.get(room) {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(RelayError::NotInRoom),
        }
    }

    fn report_error(&mut self, operation: &str, room: RoomSlug, error: &RelayError) {
        prom::record_error(operation, error.error_type_label(), error.status_code());

        match error {
            RelayError::Redis(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                warn!(
                    target: "relay.session",
                    connection_id = %self.connection.connection_id(),
                    room = %room,
                    operation = operation,
                    error = %error,
                    "Room operation failed"
                );
            }
            _ => {
                debug!(
                    target: "relay.session",
                    connection_id = %self.connection.connection_id(),
                    room = %room,
                    operation = operation,
                    error = %error,
                    "Room operation rejected"
                );
            }
        }

        // Membership was lost (kicked or replaced by a newer connection).
        if matches!(error, RelayError::NotInRoom) {
            self.joined.remove(&room);
        }

        let event = match operation {
            "join" => ServerEvent::JoinResponse {
                room,
                success: false,
                error: Some(error.client_message()),
            },
            "chat_send" => ServerEvent::ChatResponse {
                room,
                success: false,
                error: Some(error.client_message()),
                message: None,
            },
            _ => ServerEvent::error(Some(room), error.error_code(), error.client_message()),
        };
        self.connection.deliver(event);
    }

    /// Queue an event for this connection only.
    pub fn deliver(&self, event: ServerEvent) {
        self.connection.deliver(event);
    }

    fn send_error(&self, room: Option<RoomSlug>, code: i32, message: impl Into<String>) {
        self.connection.deliver(ServerEvent::error(room, code, message));
    }

    /// Leave every joined room. Runs when the socket goes away for any reason.
    pub async fn disconnect(&mut self) {
        let SessionState::Authenticated(identity) = &self.state else {
            return;
        };
        let user_id = identity.user_id.clone();
        let connection_id = self.connection.connection_id();

        for (room, handle) in self.joined.drain() {
            match handle.leave(user_id.clone(), connection_id).await {
                Ok(removed) => {
                    debug!(
                        target: "relay.session",
                        connection_id = %connection_id,
                        user_id = %user_id,
                        room = %room,
                        removed = removed,
                        "Disconnect cleanup"
                    );
                }
                Err(e) => {
                    debug!(
                        target: "relay.session",
                        connection_id = %connection_id,
                        room = %room,
                        error = %e,
                        "Room gone during disconnect cleanup"
                    );
                }
            }
        }

        self.sweep_orphaned_records(&user_id, connection_id).await;
    }

    /// Remove records this connection still owns in rooms it no longer
    /// tracks. Records held by another connection of the same user stay.
    async fn sweep_orphaned_records(&self, user_id: &UserId, connection_id: ConnectionId) {
        let registry = &self.context.registry;
        let rooms = match registry.rooms_for_user(user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(
                    target: "relay.session",
                    user_id = %user_id,
                    error = %e,
                    "Registry lookup failed during disconnect cleanup"
                );
                return;
            }
        };

        for room in rooms {
            let owned = match registry.list_participants(&room).await {
                Ok(records) => records
                    .iter()
                    .any(|r| r.user_id() == user_id && r.connection_id == connection_id),
                Err(e) => {
                    warn!(
                        target: "relay.session",
                        room = %room,
                        error = %e,
                        "Registry list failed during disconnect cleanup"
                    );
                    continue;
                }
            };
            if !owned {
                continue;
            }
            match registry.remove_participant(&room, user_id).await {
                Ok(removed) => debug!(
                    target: "relay.session",
                    connection_id = %connection_id,
                    room = %room,
                    removed = removed,
                    "Removed orphaned registry record"
                ),
                Err(e) => warn!(
                    target: "relay.session",
                    room = %room,
                    error = %e,
                    "Failed to remove orphaned registry record"
                ),
            }
        }
    }
}
