//! WebSocket test client.
//!
//! Speaks the signaling protocol over `tokio-tungstenite`. Every receive has
//! a timeout so a missing event fails the test instead of hanging it.

use common::types::{RoomSlug, UserId};
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{
    decode_server_event, encode_client_message, ClientMessage, ParticipantSnapshot, ServerEvent,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default time to wait for a single event.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// What the relay did instead of sending an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closed {
    /// Close frame with its code.
    Frame(u16),
    /// Stream ended without a close frame.
    Eof,
}

/// Signaling client for end-to-end tests
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        Ok(Self { stream })
    }

    /// Send a protocol message
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), anyhow::Error> {
        let frame = encode_client_message(message)?;
        self.send_raw(&frame).await
    }

    /// Send an arbitrary text frame
    pub async fn send_raw(&mut self, frame: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Next event, or how the socket ended
    pub async fn next_event(&mut self) -> Result<Result<ServerEvent, Closed>, anyhow::Error> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for relay event"))?;

            match frame {
                Some(Ok(Message::Text(text))) => return Ok(Ok(decode_server_event(&text)?)),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Err(frame.map_or(Closed::Eof, |f| Closed::Frame(f.code.into()))))
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(Err(Closed::Eof)),
            }
        }
    }

    /// Next event; fails if the socket closed
    pub async fn recv(&mut self) -> Result<ServerEvent, anyhow::Error> {
        self.next_event()
            .await?
            .map_err(|closed| anyhow::anyhow!("Socket closed: {:?}", closed))
    }

    /// Skip events until one matches
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> Result<ServerEvent, anyhow::Error>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let event = self.recv().await?;
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    /// Skip events until the socket closes
    pub async fn expect_closed(&mut self) -> Result<Closed, anyhow::Error> {
        loop {
            if let Err(closed) = self.next_event().await? {
                return Ok(closed);
            }
        }
    }

    /// Assert nothing arrives for `window`
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(window, self.stream.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => {
                Err(anyhow::anyhow!("Expected silence, got {}", text))
            }
            Ok(other) => Err(anyhow::anyhow!("Expected silence, got {:?}", other)),
        }
    }

    /// Authenticate and return the relay's view of our user ID
    pub async fn authenticate(&mut self, token: &str) -> Result<UserId, anyhow::Error> {
        self.send(&ClientMessage::Authenticate {
            token: token.to_string(),
        })
        .await?;
        match self.recv().await? {
            ServerEvent::Authenticated { user_id, .. } => Ok(user_id),
            other => Err(anyhow::anyhow!("Expected authenticated, got {:?}", other)),
        }
    }

    /// Join a room and return the snapshot of the other participants
    pub async fn join(
        &mut self,
        room: &str,
        password: Option<&str>,
    ) -> Result<Vec<ParticipantSnapshot>, anyhow::Error> {
        self.send(&ClientMessage::Join {
            room: RoomSlug::from(room),
            password: password.map(str::to_string),
            muted: false,
            camera_off: false,
        })
        .await?;

        match self.recv().await? {
            ServerEvent::JoinResponse { success: true, .. } => {}
            other => return Err(anyhow::anyhow!("Join failed: {:?}", other)),
        }
        match self.recv().await? {
            ServerEvent::Joined { participants, .. } => Ok(participants),
            other => Err(anyhow::anyhow!("Expected joined, got {:?}", other)),
        }
    }
}
