//! `RoomActor` - one actor per live room.
//!
//! The room actor owns the room's delivery set and serialises every room
//! operation, so join snapshots, fan-out and removals are totally ordered
//! per room:
//!
//! - Join: capacity check, registry upsert, fresh snapshot, then
//!   `join-response`, `joined` and `request-offers` to the joiner before
//!   `user-joined` reaches anyone else
//! - Leave/disconnect/kick: the member leaves the delivery set before the
//!   registry and before `user-left` is sent
//! - Signals are forwarded to the target's connection with the sender
//!   attached, or dropped if the target is gone
//!
//! Live members have their registry TTL refreshed every half TTL. When the
//! delivery set becomes empty the actor reports itself idle to the
//! controller, which asks it to stop.

use crate::auth::Identity;
use crate::chat::{check_reply_target, validate_chat_text, PersistentChatLog};
use crate::directory::RoomDirectory;
use crate::errors::RelayError;
use crate::registry::{ParticipantPatch, RegisteredParticipant, SessionRegistry};

use super::connection::ConnectionActorHandle;
use super::messages::{ControllerMessage, JoinRequest, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::Utc;
use common::types::{ConnectionId, RoomSlug, UserId};
use signaling_protocol::{
    ChatAuthor, ChatMessage, MediaFlagsPatch, ParticipantSnapshot, RelayEnvelope, ServerEvent,
    SignalKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Lower bound on the keepalive period.
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Stores shared by every room actor.
#[derive(Clone)]
pub struct RoomServices {
    pub registry: Arc<dyn SessionRegistry>,
    pub directory: Arc<dyn RoomDirectory>,
    pub chat_log: Arc<dyn PersistentChatLog>,
    /// Registry record TTL.
    pub participant_ttl: Duration,
}

impl RoomServices {
    fn keepalive_interval(&self) -> Duration {
        (self.participant_ttl / 2).max(MIN_KEEPALIVE_INTERVAL)
    }
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room: RoomSlug,
    instance: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room(&self) -> &RoomSlug {
        &self.room
    }

    #[must_use]
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Admit a connection. Success frames are delivered by the room itself.
    pub async fn join(&self, request: JoinRequest) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                request: Box::new(request),
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a member if `connection_id` still owns its membership.
    pub async fn leave(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                user_id,
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Relay a negotiation message to another member.
    pub async fn signal(
        &self,
        from: UserId,
        connection_id: ConnectionId,
        to: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        self.sender
            .send(RoomMessage::Signal {
                from,
                connection_id,
                to,
                kind,
                payload,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn control_update(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        patch: MediaFlagsPatch,
    ) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::ControlUpdate {
                user_id,
                connection_id,
                patch,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn kick(
        &self,
        requester: UserId,
        connection_id: ConnectionId,
        target: UserId,
    ) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Kick {
                requester,
                connection_id,
                target,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn transfer_host(
        &self,
        requester: UserId,
        connection_id: ConnectionId,
        target: UserId,
    ) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::TransferHost {
                requester,
                connection_id,
                target,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn chat(
        &self,
        author: Identity,
        connection_id: ConnectionId,
        text: String,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Chat {
                author,
                connection_id,
                text,
                reply_to,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_state(&self) -> Result<RoomState, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Ask the actor to stop if its delivery set is empty.
    pub async fn close_if_empty(&self) -> Result<bool, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::CloseIfEmpty { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// True once the actor has stopped and no longer accepts messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A connection currently receiving this room's events.
struct Member {
    identity: Identity,
    connection_id: ConnectionId,
    connection: ConnectionActorHandle,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room: RoomSlug,
    instance: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Used to report the room idle.
    controller: mpsc::Sender<ControllerMessage>,
    services: RoomServices,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    /// Delivery set, keyed by user. At most one connection per user.
    members: HashMap<UserId, Member>,
    idle_reported: bool,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room: RoomSlug,
        instance: u64,
        services: RoomServices,
        controller: mpsc::Sender<ControllerMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room: room.clone(),
            instance,
            receiver,
            cancel_token: cancel_token.clone(),
            controller,
            services,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room.as_str()),
            members: HashMap::new(),
            idle_reported: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room,
            instance,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.room", fields(room = %self.room))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.room",
            room = %self.room,
            instance = self.instance,
            "RoomActor started"
        );

        let period = self.services.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.room",
                        room = %self.room,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = keepalive.tick() => {
                    self.refresh_members().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len() + 1);
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                            self.report_if_idle();
                        }
                        None => {
                            info!(
                                target: "relay.actor.room",
                                room = %self.room,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.room",
            room = %self.room,
            members = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(*request).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                user_id,
                connection_id,
                respond_to,
            } => {
                let removed = self.handle_leave(&user_id, connection_id).await;
                let _ = respond_to.send(removed);
            }

            RoomMessage::Signal {
                from,
                connection_id,
                to,
                kind,
                payload,
            } => {
                self.handle_signal(from, connection_id, to, kind, payload);
            }

            RoomMessage::ControlUpdate {
                user_id,
                connection_id,
                patch,
                respond_to,
            } => {
                let result = self
                    .handle_control_update(&user_id, connection_id, patch)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Kick {
                requester,
                connection_id,
                target,
                respond_to,
            } => {
                let result = self.handle_kick(&requester, connection_id, target).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::TransferHost {
                requester,
                connection_id,
                target,
                respond_to,
            } => {
                let result = self
                    .handle_transfer_host(&requester, connection_id, target)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Chat {
                author,
                connection_id,
                text,
                reply_to,
                respond_to,
            } => {
                let result = self
                    .handle_chat(&author, connection_id, &text, reply_to)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let state = self.get_state().await;
                let _ = respond_to.send(state);
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                let closing = self.members.is_empty();
                if !closing {
                    // Someone joined after the idle report; report again later.
                    self.idle_reported = false;
                }
                let _ = respond_to.send(closing);
                return closing;
            }
        }

        false
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<(), RelayError> {
        let JoinRequest {
            identity,
            connection_id,
            connection,
            flags,
            is_host,
            max_participants,
        } = request;
        let user_id = identity.user_id.clone();

        let current = self.services.registry.list_participants(&self.room).await?;
        let others = current.iter().filter(|p| p.user_id() != &user_id).count();
        if max_participants > 0 && others >= max_participants as usize {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                user_id = %user_id,
                max_participants = max_participants,
                "Room is full"
            );
            return Err(RelayError::RoomFull);
        }

        let record = RegisteredParticipant {
            snapshot: ParticipantSnapshot {
                user_id: user_id.clone(),
                display_name: identity.display_name.clone(),
                avatar_url: identity.avatar_url.clone(),
                muted: flags.muted,
                camera_off: flags.camera_off,
                screen_sharing: false,
                is_host,
            },
            connection_id,
            joined_at: Utc::now(),
        };
        self.services
            .registry
            .add_participant(&self.room, record.clone())
            .await?;

        if let Some(previous) = self.members.insert(
            user_id.clone(),
            Member {
                identity,
                connection_id,
                connection: connection.clone(),
            },
        ) {
            if previous.connection_id != connection_id {
                info!(
                    target: "relay.actor.room",
                    room = %self.room,
                    user_id = %user_id,
                    old_connection_id = %previous.connection_id,
                    connection_id = %connection_id,
                    "Membership moved to a new connection"
                );
            }
        }
        self.idle_reported = false;

        // Snapshot from the registry as it is now, not from local state.
        let fresh = self.services.registry.list_participants(&self.room).await?;
        let mut local = record.snapshot;
        let mut participants = Vec::with_capacity(fresh.len());
        for p in fresh {
            if p.user_id() == &user_id {
                local = p.snapshot;
            } else {
                participants.push(p.snapshot);
            }
        }

        connection.deliver(ServerEvent::JoinResponse {
            room: self.room.clone(),
            success: true,
            error: None,
        });
        connection.deliver(ServerEvent::Joined {
            room: self.room.clone(),
            local: local.clone(),
            participants: participants.clone(),
        });
        if !participants.is_empty() {
            connection.deliver(ServerEvent::RequestOffers {
                room: self.room.clone(),
                participants,
            });
        }

        self.broadcast(
            &ServerEvent::UserJoined {
                room: self.room.clone(),
                participant: local,
            },
            Some(&user_id),
        );

        info!(
            target: "relay.actor.room",
            room = %self.room,
            user_id = %user_id,
            connection_id = %connection_id,
            members = self.members.len(),
            "Participant joined"
        );

        Ok(())
    }

    async fn handle_leave(&mut self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        if self.member_of(user_id, connection_id).is_err() {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                user_id = %user_id,
                connection_id = %connection_id,
                "Leave from a connection that does not own the membership"
            );
            return false;
        }

        self.members.remove(user_id);
        self.remove_from_registry(user_id).await;

        self.broadcast(
            &ServerEvent::UserLeft {
                room: self.room.clone(),
                user_id: user_id.clone(),
            },
            None,
        );

        info!(
            target: "relay.actor.room",
            room = %self.room,
            user_id = %user_id,
            members = self.members.len(),
            "Participant left"
        );

        true
    }

    fn handle_signal(
        &self,
        from: UserId,
        connection_id: ConnectionId,
        to: UserId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) {
        if self.member_of(&from, connection_id).is_err() {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                from = %from,
                kind = kind.as_str(),
                "Dropping signal from non-member"
            );
            return;
        }

        let Some(target) = self.members.get(&to) else {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                from = %from,
                to = %to,
                kind = kind.as_str(),
                "Signal target not in room, dropping"
            );
            return;
        };

        target
            .connection
            .deliver(ServerEvent::Signal(RelayEnvelope {
                kind,
                from,
                to,
                room: self.room.clone(),
                payload,
            }));
    }

    async fn handle_control_update(
        &mut self,
        user_id: &UserId,
        connection_id: ConnectionId,
        patch: MediaFlagsPatch,
    ) -> Result<(), RelayError> {
        self.member_of(user_id, connection_id)?;

        if patch.is_empty() {
            return Ok(());
        }

        let updated = self
            .services
            .registry
            .update_participant(&self.room, user_id, &ParticipantPatch::media(patch))
            .await?;

        let Some(updated) = updated else {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                user_id = %user_id,
                "Control update for absent registry record ignored"
            );
            return Ok(());
        };

        self.broadcast(
            &ServerEvent::ControlChanged {
                room: self.room.clone(),
                user_id: user_id.clone(),
                flags: updated.snapshot.flags(),
            },
            Some(user_id),
        );

        Ok(())
    }

    async fn handle_kick(
        &mut self,
        requester: &UserId,
        connection_id: ConnectionId,
        target: UserId,
    ) -> Result<(), RelayError> {
        self.member_of(requester, connection_id)?;
        self.require_host(requester).await?;

        if &target == requester {
            return Err(RelayError::InvalidMessage(
                "You cannot kick yourself".to_string(),
            ));
        }

        let kicked = self.members.remove(&target);
        let had_record = self.remove_from_registry(&target).await;

        match kicked {
            Some(member) => {
                member.connection.deliver(ServerEvent::Kicked {
                    room: self.room.clone(),
                });
            }
            None if !had_record => {
                debug!(
                    target: "relay.actor.room",
                    room = %self.room,
                    target = %target,
                    "Kick target not in room"
                );
                return Ok(());
            }
            None => {}
        }

        self.broadcast(
            &ServerEvent::UserLeft {
                room: self.room.clone(),
                user_id: target.clone(),
            },
            None,
        );

        info!(
            target: "relay.actor.room",
            room = %self.room,
            host = %requester,
            kicked = %target,
            "Participant kicked"
        );

        Ok(())
    }

    async fn handle_transfer_host(
        &mut self,
        requester: &UserId,
        connection_id: ConnectionId,
        target: UserId,
    ) -> Result<(), RelayError> {
        self.member_of(requester, connection_id)?;
        self.require_host(requester).await?;

        if &target == requester {
            return Err(RelayError::InvalidMessage(
                "You are already the host".to_string(),
            ));
        }

        let participants = self.services.registry.list_participants(&self.room).await?;
        let Some(new_host) = participants.into_iter().find(|p| p.user_id() == &target) else {
            return Err(RelayError::TargetNotFound(target.to_string()));
        };

        self.services
            .directory
            .update_host(&self.room, &target)
            .await?;
        self.services
            .registry
            .update_participant(&self.room, requester, &ParticipantPatch::host(false))
            .await?;
        self.services
            .registry
            .update_participant(&self.room, &target, &ParticipantPatch::host(true))
            .await?;

        self.broadcast(
            &ServerEvent::HostChanged {
                room: self.room.clone(),
                new_host_id: target.clone(),
                new_host_name: new_host.snapshot.display_name,
            },
            None,
        );

        info!(
            target: "relay.actor.room",
            room = %self.room,
            old_host = %requester,
            new_host = %target,
            "Host transferred"
        );

        Ok(())
    }

    async fn handle_chat(
        &mut self,
        author: &Identity,
        connection_id: ConnectionId,
        text: &str,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, RelayError> {
        let sender = self.member_of(&author.user_id, connection_id)?.connection.clone();

        let text = validate_chat_text(text)?;
        if let Some(reply_to) = reply_to {
            check_reply_target(self.services.chat_log.as_ref(), &self.room, reply_to).await?;
        }

        let message = self
            .services
            .chat_log
            .append(
                &self.room,
                ChatAuthor {
                    id: author.user_id.clone(),
                    display_name: author.display_name.clone(),
                    avatar_url: author.avatar_url.clone(),
                },
                text,
                reply_to,
            )
            .await?;

        sender.deliver(ServerEvent::ChatResponse {
            room: self.room.clone(),
            success: true,
            error: None,
            message: Some(message.clone()),
        });
        self.broadcast(
            &ServerEvent::ChatMessage {
                room: self.room.clone(),
                message: message.clone(),
            },
            None,
        );

        Ok(message)
    }

    async fn get_state(&self) -> RoomState {
        let participants = match self.services.registry.list_participants(&self.room).await {
            Ok(participants) => participants,
            Err(e) => {
                warn!(
                    target: "relay.actor.room",
                    room = %self.room,
                    error = %e,
                    "Failed to read registry for room state"
                );
                Vec::new()
            }
        };

        let mut members: Vec<UserId> = self.members.keys().cloned().collect();
        members.sort();

        RoomState {
            room: self.room.clone(),
            members,
            participants,
        }
    }

    /// The member entry, if `connection_id` owns it.
    fn member_of(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Result<&Member, RelayError> {
        match self.members.get(user_id) {
            Some(member) if member.connection_id == connection_id => Ok(member),
            _ => Err(RelayError::NotInRoom),
        }
    }

    /// Check the requester against the directory's host.
    async fn require_host(&self, requester: &UserId) -> Result<(), RelayError> {
        let record = self
            .services
            .directory
            .find_by_slug(&self.room)
            .await?
            .ok_or_else(|| RelayError::RoomNotFound(self.room.to_string()))?;

        if &record.host_id == requester {
            Ok(())
        } else {
            Err(RelayError::NotHost)
        }
    }

    /// Remove a registry record, logging failures. TTL expiry reclaims
    /// records whose removal failed.
    async fn remove_from_registry(&self, user_id: &UserId) -> bool {
        match self
            .services
            .registry
            .remove_participant(&self.room, user_id)
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(
                    target: "relay.actor.room",
                    room = %self.room,
                    user_id = %user_id,
                    error = %e,
                    "Failed to remove participant from registry"
                );
                false
            }
        }
    }

    fn broadcast(&self, event: &ServerEvent, except: Option<&UserId>) {
        for (user_id, member) in &self.members {
            if Some(user_id) == except {
                continue;
            }
            member.connection.deliver(event.clone());
        }
    }

    /// Refresh the registry TTL of every live member.
    async fn refresh_members(&self) {
        for user_id in self.members.keys() {
            match self.services.registry.refresh(&self.room, user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        target: "relay.actor.room",
                        room = %self.room,
                        user_id = %user_id,
                        "Live member has no registry record"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "relay.actor.room",
                        room = %self.room,
                        user_id = %user_id,
                        error = %e,
                        "Failed to refresh registry record"
                    );
                }
            }
        }
    }

    fn report_if_idle(&mut self) {
        if !self.members.is_empty() || self.idle_reported {
            return;
        }
        self.idle_reported = true;

        if let Err(e) = self.controller.try_send(ControllerMessage::RoomIdle {
            room: self.room.clone(),
            instance: self.instance,
        }) {
            debug!(
                target: "relay.actor.room",
                room = %self.room,
                error = %e,
                "Failed to report idle room"
            );
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "relay.actor.room",
            room = %self.room,
            members = self.members.len(),
            "Performing graceful shutdown"
        );

        for (user_id, member) in std::mem::take(&mut self.members) {
            self.remove_from_registry(&user_id).await;
            let _ = member.connection.close("Server shutting down").await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::actors::messages::OutboundFrame;
    use crate::directory::RoomRecord;
    use crate::registry::InMemoryRegistry;
    use async_trait::async_trait;
    use signaling_protocol::{decode_server_event, MediaFlags};
    use std::sync::Mutex;

    const ROOM: &str = "standup";

    #[derive(Default)]
    struct FakeDirectory {
        rooms: Mutex<HashMap<RoomSlug, RoomRecord>>,
    }

    #[async_trait]
    impl RoomDirectory for FakeDirectory {
        async fn find_by_slug(&self, room: &RoomSlug) -> Result<Option<RoomRecord>, RelayError> {
            Ok(self.rooms.lock().unwrap().get(room).cloned())
        }

        async fn update_host(&self, room: &RoomSlug, new_host: &UserId) -> Result<(), RelayError> {
            let mut rooms = self.rooms.lock().unwrap();
            let record = rooms
                .get_mut(room)
                .ok_or_else(|| RelayError::RoomNotFound(room.to_string()))?;
            record.host_id = new_host.clone();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeChatLog {
        messages: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl PersistentChatLog for FakeChatLog {
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
            self.messages.lock().unwrap().push(message.clone());
            Ok(message)
        }

        async fn recent(
            &self,
            room: &RoomSlug,
            limit: usize,
        ) -> Result<Vec<ChatMessage>, RelayError> {
            let messages = self.messages.lock().unwrap();
            let in_room: Vec<_> = messages.iter().filter(|m| &m.room == room).cloned().collect();
            let skip = in_room.len().saturating_sub(limit);
            Ok(in_room.into_iter().skip(skip).collect())
        }
    }

    struct Fixture {
        handle: RoomActorHandle,
        registry: Arc<InMemoryRegistry>,
        directory: Arc<FakeDirectory>,
        controller_rx: mpsc::Receiver<ControllerMessage>,
        metrics: Arc<ActorMetrics>,
    }

    fn fixture(host: &str, max_participants: u32) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(60)));
        let directory = Arc::new(FakeDirectory::default());
        directory.rooms.lock().unwrap().insert(
            RoomSlug::from(ROOM),
            RoomRecord {
                host_id: UserId::from(host),
                password_hash: None,
                max_participants,
            },
        );
        let services = RoomServices {
            registry: Arc::clone(&registry) as Arc<dyn SessionRegistry>,
            directory: Arc::clone(&directory) as Arc<dyn RoomDirectory>,
            chat_log: Arc::new(FakeChatLog::default()),
            participant_ttl: Duration::from_secs(60),
        };
        let (controller_tx, controller_rx) = mpsc::channel(16);
        let metrics = ActorMetrics::new();
        let (handle, _task) = RoomActor::spawn(
            RoomSlug::from(ROOM),
            1,
            services,
            controller_tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        Fixture {
            handle,
            registry,
            directory,
            controller_rx,
            metrics,
        }
    }

    struct Client {
        identity: Identity,
        connection: ConnectionActorHandle,
        frames: mpsc::Receiver<OutboundFrame>,
    }

    impl Client {
        fn new(user: &str, metrics: &Arc<ActorMetrics>) -> Self {
            let (tx, frames) = mpsc::channel(64);
            let (connection, _task) = ConnectionActor::spawn(
                ConnectionId::new(),
                tx,
                CancellationToken::new(),
                Arc::clone(metrics),
            );
            Self {
                identity: Identity {
                    user_id: UserId::from(user),
                    display_name: user.to_uppercase(),
                    avatar_url: None,
                },
                connection,
                frames,
            }
        }

        fn id(&self) -> UserId {
            self.identity.user_id.clone()
        }

        fn cid(&self) -> ConnectionId {
            self.connection.connection_id()
        }

        fn join_request(&self, is_host: bool, max_participants: u32) -> JoinRequest {
            JoinRequest {
                identity: self.identity.clone(),
                connection_id: self.cid(),
                connection: self.connection.clone(),
                flags: MediaFlags::default(),
                is_host,
                max_participants,
            }
        }

        async fn next_event(&mut self) -> ServerEvent {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.frames.recv())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed");
            match frame {
                OutboundFrame::Text(text) => decode_server_event(&text).unwrap(),
                OutboundFrame::Close { .. } => panic!("unexpected close frame"),
            }
        }

        async fn assert_silent(&mut self) {
            let result = tokio::time::timeout(Duration::from_millis(50), self.frames.recv()).await;
            assert!(result.is_err(), "unexpected frame: {result:?}");
        }
    }

    async fn join(f: &Fixture, client: &mut Client) {
        f.handle.join(client.join_request(false, 0)).await.unwrap();
    }

    /// Join and consume the joiner's own reply frames.
    async fn join_and_drain(f: &Fixture, client: &mut Client, others: usize) {
        join(f, client).await;
        assert!(matches!(
            client.next_event().await,
            ServerEvent::JoinResponse { success: true, .. }
        ));
        assert!(matches!(client.next_event().await, ServerEvent::Joined { .. }));
        if others > 0 {
            assert!(matches!(
                client.next_event().await,
                ServerEvent::RequestOffers { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_first_joiner_gets_empty_snapshot() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);

        join(&f, &mut x).await;

        assert_eq!(
            x.next_event().await,
            ServerEvent::JoinResponse {
                room: RoomSlug::from(ROOM),
                success: true,
                error: None
            }
        );
        let ServerEvent::Joined {
            local,
            participants,
            ..
        } = x.next_event().await
        else {
            panic!("expected joined");
        };
        assert_eq!(local.user_id, x.id());
        assert!(participants.is_empty());
        // No request-offers when alone.
        x.assert_silent().await;
    }

    #[tokio::test]
    async fn test_second_joiner_sees_first_and_first_sees_second() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join(&f, &mut y).await;

        assert!(matches!(
            y.next_event().await,
            ServerEvent::JoinResponse { success: true, .. }
        ));
        let ServerEvent::Joined { participants, .. } = y.next_event().await else {
            panic!("expected joined");
        };
        assert_eq!(participants.len(), 1);
        assert_eq!(participants.first().unwrap().user_id, x.id());
        let ServerEvent::RequestOffers { participants, .. } = y.next_event().await else {
            panic!("expected request-offers");
        };
        assert_eq!(participants.first().unwrap().user_id, x.id());

        let ServerEvent::UserJoined { participant, .. } = x.next_event().await else {
            panic!("expected user-joined");
        };
        assert_eq!(participant.user_id, y.id());
        // Y never hears about itself.
        y.assert_silent().await;
    }

    #[tokio::test]
    async fn test_room_full() {
        let f = fixture("host", 1);
        let mut x = Client::new("x", &f.metrics);
        let y = Client::new("y", &f.metrics);

        f.handle.join(x.join_request(false, 1)).await.unwrap();
        let result = f.handle.join(y.join_request(false, 1)).await;
        assert!(matches!(result, Err(RelayError::RoomFull)));

        // Re-joining an already present user does not count against capacity.
        f.handle.join(x.join_request(false, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_broadcasts_and_reports_idle() {
        let mut f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join_and_drain(&f, &mut y, 1).await;
        let _ = x.next_event().await; // user-joined(y)

        assert!(f.handle.leave(y.id(), y.cid()).await.unwrap());
        assert_eq!(
            x.next_event().await,
            ServerEvent::UserLeft {
                room: RoomSlug::from(ROOM),
                user_id: y.id()
            }
        );
        y.assert_silent().await;

        assert!(f.handle.leave(x.id(), x.cid()).await.unwrap());
        let registered = f
            .registry
            .list_participants(&RoomSlug::from(ROOM))
            .await
            .unwrap();
        assert!(registered.is_empty());

        let idle = tokio::time::timeout(Duration::from_secs(1), f.controller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(idle, ControllerMessage::RoomIdle { instance: 1, .. }));
        assert!(f.handle.close_if_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_evict_newer_session() {
        let f = fixture("host", 0);
        let mut old = Client::new("x", &f.metrics);
        let mut new = Client::new("x", &f.metrics);

        join_and_drain(&f, &mut old, 0).await;
        join_and_drain(&f, &mut new, 0).await;

        assert!(!f.handle.leave(old.id(), old.cid()).await.unwrap());

        let state = f.handle.get_state().await.unwrap();
        assert_eq!(state.members, vec![UserId::from("x")]);
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants.first().unwrap().connection_id, new.cid());
    }

    #[tokio::test]
    async fn test_signal_forwarded_with_sender_attached() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join_and_drain(&f, &mut y, 1).await;
        let _ = x.next_event().await;

        let payload = serde_json::json!({"type": "offer", "sdp": "v=0"});
        f.handle
            .signal(y.id(), y.cid(), x.id(), SignalKind::Offer, payload.clone())
            .await
            .unwrap();

        let ServerEvent::Signal(envelope) = x.next_event().await else {
            panic!("expected signal");
        };
        assert_eq!(envelope.from, y.id());
        assert_eq!(envelope.to, x.id());
        assert_eq!(envelope.kind, SignalKind::Offer);
        assert_eq!(envelope.payload, payload);
    }

    #[tokio::test]
    async fn test_signal_to_absent_target_is_dropped() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        f.handle
            .signal(
                x.id(),
                x.cid(),
                UserId::from("gone"),
                SignalKind::IceCandidate,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        // The room keeps working.
        assert_eq!(f.handle.get_state().await.unwrap().members.len(), 1);
        x.assert_silent().await;
    }

    #[tokio::test]
    async fn test_control_update_excludes_sender() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join_and_drain(&f, &mut y, 1).await;
        let _ = x.next_event().await;

        let patch = MediaFlagsPatch {
            muted: Some(true),
            ..MediaFlagsPatch::default()
        };
        f.handle.control_update(y.id(), y.cid(), patch).await.unwrap();

        let ServerEvent::ControlChanged { user_id, flags, .. } = x.next_event().await else {
            panic!("expected control-changed");
        };
        assert_eq!(user_id, y.id());
        assert!(flags.muted);
        y.assert_silent().await;
    }

    #[tokio::test]
    async fn test_kick_requires_host() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join_and_drain(&f, &mut y, 1).await;

        let result = f.handle.kick(y.id(), y.cid(), x.id()).await;
        assert!(matches!(result, Err(RelayError::NotHost)));
    }

    #[tokio::test]
    async fn test_kick_notifies_target_and_room() {
        let f = fixture("host", 0);
        let mut host = Client::new("host", &f.metrics);
        let mut p = Client::new("p", &f.metrics);
        let mut other = Client::new("other", &f.metrics);

        join_and_drain(&f, &mut host, 0).await;
        join_and_drain(&f, &mut p, 1).await;
        join_and_drain(&f, &mut other, 2).await;
        let _ = host.next_event().await; // user-joined(p)
        let _ = host.next_event().await; // user-joined(other)
        let _ = p.next_event().await; // user-joined(other)

        f.handle.kick(host.id(), host.cid(), p.id()).await.unwrap();

        assert!(matches!(p.next_event().await, ServerEvent::Kicked { .. }));
        for member in [&mut host, &mut other] {
            assert_eq!(
                member.next_event().await,
                ServerEvent::UserLeft {
                    room: RoomSlug::from(ROOM),
                    user_id: p.id()
                }
            );
        }

        // The kicked participant's later updates are refused and never broadcast.
        let result = f
            .handle
            .control_update(p.id(), p.cid(), MediaFlagsPatch {
                muted: Some(true),
                ..MediaFlagsPatch::default()
            })
            .await;
        assert!(matches!(result, Err(RelayError::NotInRoom)));
        other.assert_silent().await;
    }

    #[tokio::test]
    async fn test_kick_absent_target_is_silent() {
        let f = fixture("host", 0);
        let mut host = Client::new("host", &f.metrics);

        join_and_drain(&f, &mut host, 0).await;
        f.handle
            .kick(host.id(), host.cid(), UserId::from("nobody"))
            .await
            .unwrap();
        host.assert_silent().await;

        let result = f.handle.kick(host.id(), host.cid(), host.id()).await;
        assert!(matches!(result, Err(RelayError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_transfer_host() {
        let f = fixture("host", 0);
        let mut host = Client::new("host", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        f.handle.join(host.join_request(true, 0)).await.unwrap();
        for _ in 0..2 {
            let _ = host.next_event().await;
        }
        join_and_drain(&f, &mut y, 1).await;
        let _ = host.next_event().await;

        let missing = f
            .handle
            .transfer_host(host.id(), host.cid(), UserId::from("nobody"))
            .await;
        assert!(matches!(missing, Err(RelayError::TargetNotFound(_))));

        let y_id = y.id();
        f.handle
            .transfer_host(host.id(), host.cid(), y_id.clone())
            .await
            .unwrap();

        for member in [&mut host, &mut y] {
            assert_eq!(
                member.next_event().await,
                ServerEvent::HostChanged {
                    room: RoomSlug::from(ROOM),
                    new_host_id: y_id.clone(),
                    new_host_name: "Y".to_string(),
                }
            );
        }

        let record = f
            .directory
            .find_by_slug(&RoomSlug::from(ROOM))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.host_id, y.id());

        let state = f.handle.get_state().await.unwrap();
        for p in state.participants {
            assert_eq!(p.snapshot.is_host, p.user_id() == &y.id());
        }

        // The old host has lost its authority.
        let result = f.handle.kick(host.id(), host.cid(), y.id()).await;
        assert!(matches!(result, Err(RelayError::NotHost)));
    }

    #[tokio::test]
    async fn test_chat_reaches_everyone_including_sender() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        let mut y = Client::new("y", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        join_and_drain(&f, &mut y, 1).await;
        let _ = x.next_event().await;

        let message = f
            .handle
            .chat(y.identity.clone(), y.cid(), "  hello  ".to_string(), None)
            .await
            .unwrap();
        assert_eq!(message.text, "hello");

        assert!(matches!(
            y.next_event().await,
            ServerEvent::ChatResponse { success: true, .. }
        ));
        assert!(matches!(y.next_event().await, ServerEvent::ChatMessage { .. }));
        let ServerEvent::ChatMessage { message: seen, .. } = x.next_event().await else {
            panic!("expected chat-message");
        };
        assert_eq!(seen.id, message.id);

        let blank = f
            .handle
            .chat(y.identity.clone(), y.cid(), "   ".to_string(), None)
            .await;
        assert!(matches!(blank, Err(RelayError::InvalidMessage(_))));

        let bad_reply = f
            .handle
            .chat(
                y.identity.clone(),
                y.cid(),
                "re".to_string(),
                Some(Uuid::new_v4()),
            )
            .await;
        assert!(matches!(bad_reply, Err(RelayError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_close_if_empty_refuses_while_occupied() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);

        join_and_drain(&f, &mut x, 0).await;
        assert!(!f.handle.close_if_empty().await.unwrap());
        assert!(!f.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_refreshes_live_members() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        join_and_drain(&f, &mut x, 0).await;

        // Well past the original TTL; the half-TTL refresh keeps the record alive.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }

        let registered = f
            .registry
            .list_participants(&RoomSlug::from(ROOM))
            .await
            .unwrap();
        assert_eq!(registered.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_members_from_registry() {
        let f = fixture("host", 0);
        let mut x = Client::new("x", &f.metrics);
        join_and_drain(&f, &mut x, 0).await;

        f.handle.cancel();

        let frame = tokio::time::timeout(Duration::from_secs(1), x.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, OutboundFrame::Close { .. }));
        let registered = f
            .registry
            .list_participants(&RoomSlug::from(ROOM))
            .await
            .unwrap();
        assert!(registered.is_empty());
    }
}
