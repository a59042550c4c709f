//! WebSocket endpoint.
//!
//! Each upgraded socket gets three pieces:
//!
//! - a writer task that owns the sink and drains `OutboundFrame`s
//! - a `ConnectionActor` that encodes events for that writer
//! - a reader loop (this task) that feeds frames into a `RelaySession`
//!
//! The reader enforces the authentication deadline. When it exits for any
//! reason the session leaves every joined room before the socket is closed.
//! A connection that fell behind on its events is closed with
//! [`CLOSE_TRY_AGAIN_LATER`]; the writer skips whatever is still queued.

use crate::actors::connection::CLOSE_TRY_AGAIN_LATER;
use crate::actors::{ConnectionActor, OutboundFrame};
use crate::observability::metrics as prom;
use crate::session::{RelayContext, RelaySession, SessionControl};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures_util::{Sink, SinkExt, StreamExt};
use signaling_protocol::error_codes;
use signaling_protocol::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Frames buffered between the connection actor and the socket writer.
const WRITER_CHANNEL_BUFFER: usize = 64;

/// How long teardown waits for the writer to flush the close frame.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<RelayContext>,
}

/// Router serving the signaling socket at `GET /ws`.
pub fn relay_router(context: Arc<RelayContext>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { context })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_message_bytes = state.context.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.context))
}

#[instrument(skip_all, name = "relay.ws", fields(connection_id = %connection_id))]
async fn run_reader(
    connection_id: ConnectionId,
    session: &mut RelaySession,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    context: &RelayContext,
    cancel_token: CancellationToken,
    overloaded: CancellationToken,
) {
    let auth_deadline = tokio::time::sleep(context.auth_timeout);
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    "Reader cancelled"
                );
                break;
            }

            () = overloaded.cancelled() => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    "Connection overloaded, stop reading"
                );
                break;
            }

            () = &mut auth_deadline, if !session.is_authenticated() => {
                prom::record_auth("timeout");
                prom::record_error("authenticate", "unauthenticated", 2);
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    "Authentication deadline passed"
                );
                session.deliver(ServerEvent::error(
                    None,
                    error_codes::UNAUTHORIZED,
                    "Authentication timeout",
                ));
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if session.handle_frame(&text).await == SessionControl::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => session.reject_binary(),
                    // axum answers pings itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(
                            target: "relay.ws",
                            connection_id = %connection_id,
                            "Client closed socket"
                        );
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(
                            target: "relay.ws",
                            connection_id = %connection_id,
                            error = %e,
                            "Socket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Drain frames into the socket until a close frame goes out or the socket
/// fails. Once `overloaded` fires, queued frames are skipped and the socket
/// is closed with [`CLOSE_TRY_AGAIN_LATER`].
async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    overloaded: CancellationToken,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;

            () = overloaded.cancelled() => OutboundFrame::Close {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "Too far behind".to_string(),
            },

            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let (message, is_close) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text), false),
            OutboundFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
}

async fn handle_socket(socket: WebSocket, context: Arc<RelayContext>) {
    let connection_id = ConnectionId::new();
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(WRITER_CHANNEL_BUFFER);

    let cancel_token = context.controller.child_token();
    let (connection, connection_task) = ConnectionActor::spawn(
        connection_id,
        outbound_tx,
        cancel_token.clone(),
        Arc::clone(&context.metrics),
    );

    let overloaded = connection.overloaded();
    let writer = tokio::spawn(run_writer(sink, outbound_rx, overloaded.clone()));

    info!(
        target: "relay.ws",
        connection_id = %connection_id,
        "WebSocket connection opened"
    );

    let mut session = RelaySession::new(Arc::clone(&context), connection.clone());
    run_reader(
        connection_id,
        &mut session,
        stream,
        &context,
        cancel_token.clone(),
        overloaded,
    )
    .await;

    session.disconnect().await;
    // Already closing if the session or a shutdown closed it first.
    let _ = connection.close("Connection closed").await;

    let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
        let _ = connection_task.await;
        let _ = writer.await;
    })
    .await;

    info!(
        target: "relay.ws",
        connection_id = %connection_id,
        user_id = ?session.user_id(),
        "WebSocket connection closed"
    );
}
