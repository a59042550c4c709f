//! Reconnecting relay client.
//!
//! One task owns the WebSocket. It authenticates on every (re)connect and
//! replays the joins it remembers, so a dropped socket costs the room
//! session a fresh `joined` snapshot and nothing else.
//!
//! ```text
//! connect ──► authenticate ──► pump ──(socket lost)──► backoff ──► connect ...
//!                                                        │
//!                                          attempts exhausted ──► Disconnected
//! ```
//!
//! Signals queued while the socket was down are dropped on reconnect; the
//! links they belonged to are rebuilt from the new snapshot anyway. Control
//! updates are folded into the remembered media flags, so a rejoin announces
//! the state the user is in now rather than the one they joined with.

use crate::error::PeerError;

use common::secret::{ExposeSecret, SecretString};
use common::types::{RoomSlug, UserId};
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{
    decode_server_event, encode_client_message, ClientMessage, IceServer, MediaFlags,
    MediaFlagsPatch, ServerEvent,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command mailbox capacity.
pub const RELAY_COMMAND_CAPACITY: usize = 256;

/// Event channel capacity.
pub const RELAY_EVENT_CAPACITY: usize = 256;

/// How long the relay has to answer `authenticate`.
pub const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// WebSocket URL, e.g. `ws://relay:3001/ws`.
    pub url: String,
    pub token: SecretString,
    pub reconnect: ReconnectPolicy,
}

impl RelayClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, token: SecretString) -> Self {
        Self {
            url: url.into(),
            token,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// What the relay client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayClientEvent {
    /// Sent after every successful (re)authentication.
    Authenticated {
        user_id: UserId,
        ice_servers: Vec<IceServer>,
    },
    /// A frame from the relay.
    Event(ServerEvent),
    /// The socket dropped; attempt `attempt` starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A new socket is authenticated. Remembered rooms are being rejoined.
    Reconnected,
    /// Reconnecting gave up or the client was closed.
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinRequest {
    password: Option<String>,
    /// Latest flags sent for the room, replayed on rejoin.
    flags: MediaFlags,
}

#[derive(Debug)]
enum RelayCommand {
    Send(ClientMessage),
    Join { room: RoomSlug, request: JoinRequest },
    Leave { room: RoomSlug },
}

/// Handle to the relay client task.
#[derive(Clone, Debug)]
pub struct RelayClientHandle {
    sender: mpsc::Sender<RelayCommand>,
    cancel_token: CancellationToken,
    user_id: UserId,
    ice_servers: Vec<IceServer>,
}

impl RelayClientHandle {
    /// Identity the relay assigned on the first authentication.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Send a message as-is. Not replayed after a reconnect, except that a
    /// `ControlUpdate` for a joined room updates the flags a rejoin carries.
    pub async fn send(&self, message: ClientMessage) -> Result<(), PeerError> {
        self.command(RelayCommand::Send(message)).await
    }

    /// Join a room and keep rejoining it after reconnects until `leave`.
    pub async fn join(
        &self,
        room: RoomSlug,
        password: Option<String>,
        muted: bool,
        camera_off: bool,
    ) -> Result<(), PeerError> {
        self.command(RelayCommand::Join {
            room,
            request: JoinRequest {
                password,
                flags: MediaFlags {
                    muted,
                    camera_off,
                    screen_sharing: false,
                },
            },
        })
        .await
    }

    pub async fn leave(&self, room: RoomSlug) -> Result<(), PeerError> {
        self.command(RelayCommand::Leave { room }).await
    }

    async fn command(&self, command: RelayCommand) -> Result<(), PeerError> {
        self.sender
            .send(command)
            .await
            .map_err(|e| PeerError::Relay(format!("channel send failed: {e}")))
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

enum PumpExit {
    Cancelled,
    Lost(String),
}

/// The relay client task.
pub struct RelayClient {
    config: RelayClientConfig,
    commands: mpsc::Receiver<RelayCommand>,
    events: mpsc::Sender<RelayClientEvent>,
    cancel_token: CancellationToken,
    rooms: BTreeMap<RoomSlug, JoinRequest>,
}

impl RelayClient {
    /// Connect and authenticate, then hand the socket to a background task.
    ///
    /// Fails if the first connection or authentication fails; later losses
    /// are retried under the reconnect policy.
    pub async fn connect(
        config: RelayClientConfig,
        cancel_token: CancellationToken,
    ) -> Result<
        (
            RelayClientHandle,
            mpsc::Receiver<RelayClientEvent>,
            JoinHandle<()>,
        ),
        PeerError,
    > {
        let (socket, user_id, ice_servers) = establish(&config).await?;
        info!(target: "peer.relay_client", user_id = %user_id, "Connected to relay");

        let (sender, commands) = mpsc::channel(RELAY_COMMAND_CAPACITY);
        let (events, events_rx) = mpsc::channel(RELAY_EVENT_CAPACITY);

        let handle = RelayClientHandle {
            sender,
            cancel_token: cancel_token.clone(),
            user_id,
            ice_servers,
        };

        let client = Self {
            config,
            commands,
            events,
            cancel_token,
            rooms: BTreeMap::new(),
        };
        let task = tokio::spawn(client.run(socket));

        Ok((handle, events_rx, task))
    }

    #[instrument(skip_all, name = "peer.relay_client")]
    async fn run(mut self, mut socket: RelaySocket) {
        loop {
            match self.pump(&mut socket).await {
                PumpExit::Cancelled => {
                    let _ = socket.close(None).await;
                    self.emit(RelayClientEvent::Disconnected {
                        reason: "closed".to_string(),
                    })
                    .await;
                    break;
                }
                PumpExit::Lost(reason) => {
                    warn!(target: "peer.relay_client", reason = %reason, "Relay connection lost");
                    match self.reconnect().await {
                        Ok(new_socket) => {
                            socket = new_socket;
                            self.emit(RelayClientEvent::Reconnected).await;
                            self.drain_stale_commands();
                            if let Err(e) = self.rejoin(&mut socket).await {
                                warn!(target: "peer.relay_client", error = %e, "Rejoin failed");
                            }
                        }
                        Err(reason) => {
                            self.emit(RelayClientEvent::Disconnected { reason }).await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "peer.relay_client", "Relay client stopped");
    }

    async fn pump(&mut self, socket: &mut RelaySocket) -> PumpExit {
        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => return PumpExit::Cancelled,

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return PumpExit::Cancelled;
                    };
                    if let Err(e) = self.apply(command, socket).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }

                frame = socket.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            return PumpExit::Lost(format!("closed by relay (code {code:?})"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                        None => return PumpExit::Lost("stream ended".to_string()),
                    }
                }
            }
        }
    }

    async fn apply(
        &mut self,
        command: RelayCommand,
        socket: &mut RelaySocket,
    ) -> Result<(), PeerError> {
        match command {
            RelayCommand::Send(message) => {
                self.remember_flags(&message);
                send_message(socket, &message).await
            }
            RelayCommand::Join { room, request } => {
                let message = join_message(&room, &request);
                self.rooms.insert(room, request);
                send_message(socket, &message).await
            }
            RelayCommand::Leave { room } => {
                self.rooms.remove(&room);
                send_message(socket, &ClientMessage::Leave { room }).await
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let event = match decode_server_event(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(target: "peer.relay_client", error = %e, "Undecodable relay frame");
                return;
            }
        };

        match &event {
            ServerEvent::JoinResponse {
                room,
                success: false,
                ..
            }
            | ServerEvent::Kicked { room } => {
                self.rooms.remove(room);
            }
            _ => {}
        }

        self.emit(RelayClientEvent::Event(event)).await;
    }

    async fn reconnect(&mut self) -> Result<RelaySocket, String> {
        let policy = self.config.reconnect;
        let mut last_error = "no attempts made".to_string();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            self.emit(RelayClientEvent::Reconnecting { attempt, delay })
                .await;

            tokio::select! {
                () = self.cancel_token.cancelled() => return Err("closed".to_string()),
                () = tokio::time::sleep(delay) => {}
            }

            match establish(&self.config).await {
                Ok((socket, user_id, ice_servers)) => {
                    info!(
                        target: "peer.relay_client",
                        attempt = attempt,
                        "Reconnected to relay"
                    );
                    self.emit(RelayClientEvent::Authenticated {
                        user_id,
                        ice_servers,
                    })
                    .await;
                    return Ok(socket);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(target: "peer.relay_client", error = %e, "Reconnect failed permanently");
                    return Err(e.to_string());
                }
                Err(e) => {
                    debug!(
                        target: "peer.relay_client",
                        attempt = attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(format!(
            "gave up after {} attempts: {last_error}",
            policy.max_attempts
        ))
    }

    /// Keep joins and leaves that queued up while offline; drop the rest.
    fn drain_stale_commands(&mut self) {
        let mut dropped = 0usize;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RelayCommand::Join { room, request } => {
                    self.rooms.insert(room, request);
                }
                RelayCommand::Leave { room } => {
                    self.rooms.remove(&room);
                }
                RelayCommand::Send(message) => {
                    self.remember_flags(&message);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!(
                target: "peer.relay_client",
                dropped = dropped,
                "Dropped messages queued while offline"
            );
        }
    }

    fn remember_flags(&mut self, message: &ClientMessage) {
        if let ClientMessage::ControlUpdate { room, patch } = message {
            if let Some(request) = self.rooms.get_mut(room) {
                request.flags = request.flags.apply(patch);
            }
        }
    }

    async fn rejoin(&self, socket: &mut RelaySocket) -> Result<(), PeerError> {
        for (room, request) in &self.rooms {
            debug!(
                target: "peer.relay_client",
                room = %room,
                muted = request.flags.muted,
                camera_off = request.flags.camera_off,
                screen_sharing = request.flags.screen_sharing,
                "Rejoining room"
            );
            send_message(socket, &join_message(room, request)).await?;
            // `join` has no screen-share field.
            if request.flags.screen_sharing {
                let update = ClientMessage::ControlUpdate {
                    room: room.clone(),
                    patch: MediaFlagsPatch {
                        screen_sharing: Some(true),
                        ..MediaFlagsPatch::default()
                    },
                };
                send_message(socket, &update).await?;
            }
        }
        Ok(())
    }

    async fn emit(&self, event: RelayClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: "peer.relay_client", "Event receiver dropped");
        }
    }
}

fn join_message(room: &RoomSlug, request: &JoinRequest) -> ClientMessage {
    ClientMessage::Join {
        room: room.clone(),
        password: request.password.clone(),
        muted: request.flags.muted,
        camera_off: request.flags.camera_off,
    }
}

async fn send_message(socket: &mut RelaySocket, message: &ClientMessage) -> Result<(), PeerError> {
    let frame = encode_client_message(message)?;
    socket
        .send(Message::Text(frame))
        .await
        .map_err(|e| PeerError::Relay(format!("send failed: {e}")))
}

/// Open a socket and authenticate on it.
async fn establish(
    config: &RelayClientConfig,
) -> Result<(RelaySocket, UserId, Vec<IceServer>), PeerError> {
    let (mut socket, _response) = connect_async(config.url.as_str())
        .await
        .map_err(|e| PeerError::Relay(format!("connect to {} failed: {e}", config.url)))?;

    send_message(
        &mut socket,
        &ClientMessage::Authenticate {
            token: config.token.expose_secret().to_string(),
        },
    )
    .await?;

    let (user_id, ice_servers) =
        tokio::time::timeout(AUTH_RESPONSE_TIMEOUT, await_authenticated(&mut socket))
            .await
            .map_err(|_| PeerError::Relay("authentication timed out".to_string()))??;
    Ok((socket, user_id, ice_servers))
}

async fn await_authenticated(
    socket: &mut RelaySocket,
) -> Result<(UserId, Vec<IceServer>), PeerError> {
    while let Some(frame) = socket.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(PeerError::Relay(format!("read failed: {e}"))),
        };
        match decode_server_event(&text)? {
            ServerEvent::Authenticated {
                user_id,
                ice_servers,
            } => return Ok((user_id, ice_servers)),
            ServerEvent::Error { message, .. } => return Err(PeerError::AuthRejected(message)),
            _ => {}
        }
    }
    Err(PeerError::Relay(
        "connection closed during authentication".to_string(),
    ))
}
