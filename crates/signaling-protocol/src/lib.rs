//! Signaling wire protocol.
//!
//! Every frame is one JSON object tagged by `type`. Clients send
//! [`ClientMessage`]s; the relay answers and fans out [`ServerEvent`]s.
//! Offer, answer and ICE payloads travel inside [`RelayEnvelope`] and are
//! never interpreted by the relay.
//!
//! ```text
//! client ── join ──────────────▶ relay
//! client ◀─ join-response ────── relay
//! client ◀─ joined ───────────── relay   (snapshot excluding the caller)
//! client ◀─ request-offers ───── relay   (only when others are present)
//! others ◀─ user-joined ──────── relay
//! client ── signal{to: B} ─────▶ relay ── signal{from: A} ──▶ B
//! ```

#![warn(clippy::pedantic)]

pub mod codec;
pub mod events;
pub mod messages;
pub mod types;

pub use codec::{
    decode_client_message, decode_server_event, encode_client_message, encode_server_event,
    ProtocolError, DEFAULT_MAX_MESSAGE_BYTES,
};
pub use events::{error_codes, RelayEnvelope, ServerEvent};
pub use messages::ClientMessage;
pub use types::{
    ChatAuthor, ChatMessage, IceServer, MediaFlags, MediaFlagsPatch, ParticipantSnapshot,
    SignalKind,
};
