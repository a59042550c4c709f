//! Peer Client
//!
//! Client side of the room signaling system: everything between a relay
//! WebSocket and a WebRTC stack.
//!
//! # Architecture
//!
//! ```text
//! RelayClient (one task, owns the socket, reconnects)
//! └── RelayClientEvent ──► RoomSession (one per joined room)
//!                          ├── reduce() ──► MembershipView
//!                          └── LinkController (one task per remote participant)
//!                              └── PeerLink ──► dyn PeerConnection
//! ```
//!
//! # Modules
//!
//! - [`transport`] - `PeerConnection` seam and wire payloads
//! - [`media`] - Local tracks shared by every link
//! - [`negotiation`] - `PeerLink` polite-peer state machine
//! - [`controller`] - `LinkController` task per link
//! - [`membership`] - Room membership reducer
//! - [`session`] - `RoomSession` orchestration
//! - [`relay_client`] - Reconnecting relay connection
//! - [`error`] - Error types

pub mod controller;
pub mod error;
pub mod media;
pub mod membership;
pub mod negotiation;
pub mod relay_client;
pub mod session;
pub mod transport;

pub use controller::{LinkEvent, LinkHandle, LinkTimings, OutboundSignal};
pub use error::PeerError;
pub use media::{LocalMedia, LocalTracks, MediaTrack};
pub use membership::{reduce, MembershipView};
pub use negotiation::{LinkState, PeerLink};
pub use relay_client::{
    ReconnectPolicy, RelayClient, RelayClientConfig, RelayClientEvent, RelayClientHandle,
};
pub use session::{RoomSession, SessionChannels, SessionNotice};
pub use transport::{PeerConnection, PeerConnectionFactory, TrackKind, TransportEvent};
