//! `ConnectionActor` - outbound half of one WebSocket.
//!
//! Each `ConnectionActor`:
//! - Owns exactly one socket's writer channel
//! - Receives `ServerEvent`s from room actors and the session, encodes them
//!   and hands the frames to the socket writer task
//! - Is shared by every room the connection has joined
//!
//! # Backpressure
//!
//! Room actors deliver with `try_send`; a slow socket never stalls the room.
//! When the mailbox is full the event is dropped and counted, and the
//! connection is marked overloaded. An overloaded connection stops writing
//! queued events, and the socket writer closes it with
//! [`CLOSE_TRY_AGAIN_LATER`] so the client reconnects and gets a fresh
//! snapshot instead of carrying on with a view that has gaps.

use crate::errors::RelayError;

use super::messages::{ConnectionMessage, OutboundFrame};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor, CONNECTION_MAILBOX_CAPACITY};
use crate::observability::metrics as prom;

use common::types::ConnectionId;
use signaling_protocol::{encode_server_event, ServerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Close code sent for a normal close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the relay is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code sent to a client that could not keep up with its events.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    /// Fired once an event had to be dropped.
    overloaded: CancellationToken,
    connection_id: ConnectionId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue an event for the socket without waiting.
    ///
    /// Returns false if the event was dropped. A drop caused by a full
    /// mailbox marks the connection overloaded.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        if self.overloaded.is_cancelled() {
            return false;
        }
        match self.sender.try_send(ConnectionMessage::Deliver { event }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                warn!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    "Connection cannot keep up, closing it"
                );
                self.overloaded.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                prom::record_message_dropped("connection_closed");
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    "Dropped event for closed connection"
                );
                false
            }
        }
    }

    /// Close the socket.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), RelayError> {
        self.sender
            .send(ConnectionMessage::Close {
                reason: reason.into(),
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Events dropped because this connection's mailbox was full.
    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.mailbox.messages_dropped()
    }

    /// Token fired when the connection dropped an event. The socket reader
    /// and writer watch it.
    #[must_use]
    pub fn overloaded(&self) -> CancellationToken {
        self.overloaded.clone()
    }

    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.overloaded.is_cancelled()
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Frames for the socket writer task.
    outbound: mpsc::Sender<OutboundFrame>,
    /// Cancellation token (child of the server's root token).
    cancel_token: CancellationToken,
    overloaded: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing to `outbound`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        outbound: mpsc::Sender<OutboundFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_MAILBOX_CAPACITY);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        metrics.connection_created();
        let overloaded = CancellationToken::new();

        let actor = Self {
            connection_id,
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            overloaded: overloaded.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            overloaded,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                biased;

                // The socket writer sends the close frame itself; the
                // mailbox behind this actor is already full.
                () = self.overloaded.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor overloaded, exiting"
                    );
                    break;
                }

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close(CLOSE_GOING_AWAY, "Server shutting down").await;
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
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { event } => self.handle_deliver(&event).await,

            ConnectionMessage::Close { reason } => {
                self.graceful_close(CLOSE_NORMAL, &reason).await;
                true
            }
        }
    }

    /// Encode an event and hand it to the writer. Returns true once the
    /// writer is gone.
    async fn handle_deliver(&mut self, event: &ServerEvent) -> bool {
        if self.is_closing {
            return false;
        }

        let frame = match encode_server_event(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    event_type = event.event_type(),
                    error = %e,
                    "Failed to encode event"
                );
                return false;
            }
        };

        tokio::select! {
            biased;

            () = self.overloaded.cancelled() => true,

            sent = self.outbound.send(OutboundFrame::Text(frame)) => {
                if sent.is_err() {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "Socket writer gone, exiting"
                    );
                    return true;
                }
                false
            }
        }
    }

    async fn graceful_close(&mut self, code: u16, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            code = code,
            reason = reason,
            "Closing connection"
        );

        // The writer may already be gone on client-initiated close.
        let _ = self
            .outbound
            .send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::RoomSlug;
    use std::time::Duration;

    fn spawn_with_writer(
        writer_capacity: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<OutboundFrame>,
        Arc<ActorMetrics>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(writer_capacity);
        let metrics = ActorMetrics::new();
        let (handle, task) = ConnectionActor::spawn(
            ConnectionId::new(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, outbound_rx, metrics)
    }

    #[tokio::test]
    async fn test_deliver_writes_encoded_frame() {
        let (handle, _task, mut outbound, _metrics) = spawn_with_writer(8);

        assert!(handle.deliver(ServerEvent::Pong));

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, OutboundFrame::Text(r#"{"type":"pong"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_events_keep_order() {
        let (handle, _task, mut outbound, _metrics) = spawn_with_writer(8);
        let room = RoomSlug::from("standup");

        handle.deliver(ServerEvent::Kicked { room: room.clone() });
        handle.deliver(ServerEvent::Pong);

        let first = outbound.recv().await.unwrap();
        let second = outbound.recv().await.unwrap();
        assert!(matches!(first, OutboundFrame::Text(ref t) if t.contains("kicked")));
        assert!(matches!(second, OutboundFrame::Text(ref t) if t.contains("pong")));
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_and_exits() {
        let (handle, task, mut outbound, metrics) = spawn_with_writer(8);
        assert_eq!(metrics.connection_count(), 1);

        handle.close("Goodbye").await.unwrap();

        let frame = outbound.recv().await.unwrap();
        assert_eq!(
            frame,
            OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "Goodbye".to_string()
            }
        );

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.connection_count(), 0);
        assert!(!handle.deliver(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_cancel_sends_going_away() {
        let (handle, task, mut outbound, _metrics) = spawn_with_writer(8);

        handle.cancel();
        assert!(handle.is_cancelled());

        let frame = outbound.recv().await.unwrap();
        assert!(matches!(
            frame,
            OutboundFrame::Close {
                code: CLOSE_GOING_AWAY,
                ..
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_mailbox_closes_slow_connection() {
        // The writer is never drained, so the actor stalls on the second frame.
        let (handle, task, _outbound, metrics) = spawn_with_writer(1);
        let overloaded = handle.overloaded();

        let mut accepted = 0;
        while handle.deliver(ServerEvent::Pong) {
            accepted += 1;
            assert!(accepted <= CONNECTION_MAILBOX_CAPACITY + 2);
        }
        assert!(handle.is_overloaded());
        assert!(overloaded.is_cancelled());
        assert_eq!(handle.messages_dropped(), 1);

        // A departure that arrives afterwards is refused, not silently lost.
        let room = RoomSlug::from("standup");
        assert!(!handle.deliver(ServerEvent::Kicked { room }));
        assert_eq!(handle.messages_dropped(), 1);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_other_connections_unaffected_by_slow_one() {
        let (slow, _slow_task, _slow_outbound, _metrics) = spawn_with_writer(1);
        let (fast, _fast_task, mut fast_outbound, _fast_metrics) = spawn_with_writer(8);

        while slow.deliver(ServerEvent::Pong) {}

        assert!(slow.is_overloaded());
        assert!(!fast.is_overloaded());
        assert!(fast.deliver(ServerEvent::Pong));
        let frame = tokio::time::timeout(Duration::from_secs(1), fast_outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, OutboundFrame::Text(r#"{"type":"pong"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_writer_gone_stops_actor() {
        let (handle, task, outbound, _metrics) = spawn_with_writer(1);
        drop(outbound);

        handle.deliver(ServerEvent::Pong);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
