//! `RelayControllerActor` - singleton supervisor for room actors.
//!
//! The `RelayControllerActor` is the top-level actor of the relay:
//!
//! - Singleton per relay instance
//! - Spawns one `RoomActor` per live room on first use
//! - Stops rooms whose delivery set became empty
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the controller:
//! 1. Stops handing out rooms (`Draining`)
//! 2. Cancels every room, which removes its members from the registry and
//!    closes their connections
//! 3. Waits for room tasks up to the deadline
//! 4. Cancels the root token

use crate::errors::RelayError;

use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomServices};

use common::types::RoomSlug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How long to wait for a stopped room task to finish.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RelayControllerActor`.
#[derive(Clone)]
pub struct RelayControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl RelayControllerHandle {
    /// Create a new `RelayControllerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(relay_id: String, services: RoomServices, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RelayControllerActor::new(
            relay_id,
            receiver,
            sender.clone(),
            cancel_token.clone(),
            services,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Get the live room actor for a slug, spawning it if needed.
    ///
    /// Returns `Draining` once shutdown has started.
    pub async fn get_or_create_room(&self, room: RoomSlug) -> Result<RoomActorHandle, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::GetOrCreateRoom {
                room,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Shut every room down and wait up to `deadline` for them to finish.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: Instant,
}

/// The `RelayControllerActor` implementation.
pub struct RelayControllerActor {
    relay_id: String,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Given to room actors so they can report themselves idle.
    own_sender: mpsc::Sender<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    services: RoomServices,
    rooms: HashMap<RoomSlug, ManagedRoom>,
    /// Instance number for the next room actor.
    next_instance: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RelayControllerActor {
    fn new(
        relay_id: String,
        receiver: mpsc::Receiver<ControllerMessage>,
        own_sender: mpsc::Sender<ControllerMessage>,
        cancel_token: CancellationToken,
        services: RoomServices,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Controller, relay_id.as_str());

        Self {
            relay_id,
            receiver,
            own_sender,
            cancel_token,
            services,
            rooms: HashMap::new(),
            next_instance: 1,
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.controller", fields(relay_id = %self.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.controller",
            relay_id = %self.relay_id,
            "RelayControllerActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.controller",
                        relay_id = %self.relay_id,
                        "RelayControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown(ROOM_STOP_TIMEOUT).await;
                    break;
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
                        }
                        None => {
                            info!(
                                target: "relay.actor.controller",
                                relay_id = %self.relay_id,
                                "RelayControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.controller",
            relay_id = %self.relay_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RelayControllerActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ControllerMessage) -> bool {
        match message {
            ControllerMessage::GetOrCreateRoom { room, respond_to } => {
                let result = self.get_or_create_room(room);
                let _ = respond_to.send(result);
            }

            ControllerMessage::RoomIdle { room, instance } => {
                self.close_room_if_empty(&room, instance).await;
            }

            ControllerMessage::GetStatus { respond_to } => {
                let status = self.get_status();
                let _ = respond_to.send(status);
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "relay.actor.controller",
                    relay_id = %self.relay_id,
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.graceful_shutdown(deadline).await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
                return true;
            }
        }

        false
    }

    fn get_or_create_room(&mut self, room: RoomSlug) -> Result<RoomActorHandle, RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        if let Some(managed) = self.rooms.get(&room) {
            if !managed.handle.is_closed() && !managed.task_handle.is_finished() {
                return Ok(managed.handle.clone());
            }
        }

        // A finished actor is replaced here; its metrics are settled below.
        if let Some(stale) = self.rooms.remove(&room) {
            debug!(
                target: "relay.actor.controller",
                relay_id = %self.relay_id,
                room = %room,
                "Replacing stopped room actor"
            );
            stale.task_handle.abort();
            self.metrics.room_removed();
        }

        let instance = self.next_instance;
        self.next_instance += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room.clone(),
            instance,
            self.services.clone(),
            self.own_sender.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: Instant::now(),
            },
        );
        self.metrics.room_created();

        debug!(
            target: "relay.actor.controller",
            relay_id = %self.relay_id,
            room = %room,
            instance = instance,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Stop an idle room unless someone joined since it reported idle.
    async fn close_room_if_empty(&mut self, room: &RoomSlug, instance: u64) {
        let Some(managed) = self.rooms.get(room) else {
            return;
        };
        if managed.handle.instance() != instance {
            debug!(
                target: "relay.actor.controller",
                relay_id = %self.relay_id,
                room = %room,
                instance = instance,
                "Ignoring idle report from replaced room actor"
            );
            return;
        }

        match managed.handle.close_if_empty().await {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                debug!(
                    target: "relay.actor.controller",
                    relay_id = %self.relay_id,
                    room = %room,
                    error = %e,
                    "Idle room actor already stopped"
                );
            }
        }

        if let Some(managed) = self.rooms.remove(room) {
            let lifetime = managed.created_at.elapsed();
            if tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle)
                .await
                .is_err()
            {
                warn!(
                    target: "relay.actor.controller",
                    relay_id = %self.relay_id,
                    room = %room,
                    "Room actor stop timed out"
                );
            }
            self.metrics.room_removed();

            info!(
                target: "relay.actor.controller",
                relay_id = %self.relay_id,
                room = %room,
                lifetime_secs = lifetime.as_secs(),
                remaining_rooms = self.rooms.len(),
                "Room closed"
            );
        }
    }

    fn get_status(&self) -> ControllerStatus {
        let mut rooms: Vec<RoomSlug> = self.rooms.keys().cloned().collect();
        rooms.sort();

        ControllerStatus {
            active_rooms: self.rooms.len(),
            is_draining: !self.accepting_new,
            rooms,
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "relay.actor.controller",
            relay_id = %self.relay_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for (room, managed) in &self.rooms {
            debug!(
                target: "relay.actor.controller",
                relay_id = %self.relay_id,
                room = %room,
                "Cancelling room actor"
            );
            managed.handle.cancel();
        }

        let until = tokio::time::Instant::now() + deadline;
        for (room, managed) in self.rooms.drain() {
            match tokio::time::timeout_at(until, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.controller",
                        relay_id = %self.relay_id,
                        room = %room,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.controller",
                        relay_id = %self.relay_id,
                        room = %room,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.controller",
                        relay_id = %self.relay_id,
                        room = %room,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "relay.actor.controller",
            relay_id = %self.relay_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomSlug> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room, _)| room.clone())
            .collect();

        for room in finished {
            if let Some(managed) = self.rooms.remove(&room) {
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "relay.actor.controller",
                            relay_id = %self.relay_id,
                            room = %room,
                            "Room actor exited cleanly"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "relay.actor.controller",
                                relay_id = %self.relay_id,
                                room = %room,
                                error = ?join_error,
                                "Room actor panicked - triggering investigation"
                            );
                            self.metrics.record_panic(ActorType::Room);
                        }
                    }
                }

                self.metrics.room_removed();
            }
        }
    }
}
