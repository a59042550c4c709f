//! Room Signaling Relay Library
//!
//! Authenticated WebSocket relay that lets peers in a room find each other
//! and exchange WebRTC negotiation messages. Media never flows through the
//! relay; it only carries:
//!
//! - Offer, answer and ICE candidate envelopes addressed to one peer
//! - Membership events (join, leave, kick, host transfer)
//! - Per-participant media flags and room chat
//!
//! # Architecture
//!
//! ```text
//! WebSocket ──► RelaySession ──► RelayControllerActor
//!                    │                  └── RoomActor (one per live room)
//!                    │                        ├── SessionRegistry (TTL-bounded)
//!                    │                        └── delivers to ConnectionActors
//!                    └── ConnectionActor ──► socket writer
//! ```
//!
//! # Key Design Decisions
//!
//! - **Registry is the membership truth**: snapshots and capacity checks read
//!   the registry; the room actor only owns the delivery set
//! - **Records expire**: every participant record carries a TTL refreshed by
//!   the owning room, so a crashed relay never leaves ghosts behind
//! - **Errors stay local**: protocol errors go only to the offending connection
//!
//! # Modules
//!
//! - [`actors`] - Controller, room and connection actors
//! - [`session`] - Per-connection protocol state machine
//! - [`ws`] - WebSocket endpoint
//! - [`registry`] - Session registry trait and in-memory backend
//! - [`redis`] - Redis registry and collaborator stores
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes

pub mod actors;
pub mod auth;
pub mod chat;
pub mod config;
pub mod directory;
pub mod errors;
pub mod observability;
pub mod redis;
pub mod registry;
pub mod session;
pub mod ws;
