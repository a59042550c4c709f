//! Actor model implementation for the relay.
//!
//! ```text
//! RelayControllerActor (singleton per relay instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns the room's delivery set
//!         └── delivers to N ConnectionActors (shared across rooms)
//!             └── ConnectionActor (one per WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One actor per room**: every room operation is serialised in one task,
//!   so snapshots, fan-out and removals are totally ordered per room
//! - **One connection, many rooms**: a connection actor only owns the socket's
//!   outbound half; the session keeps the set of joined rooms
//! - **CancellationToken propagation**: the controller owns the root token and
//!   hands child tokens to rooms and connections
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500,
//!   Connection: 32/128)
//!
//! # Modules
//!
//! - [`controller`] - `RelayControllerActor` singleton that supervises rooms
//! - [`room`] - `RoomActor` per live room
//! - [`connection`] - `ConnectionActor` per WebSocket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod controller;
pub mod messages;
pub mod metrics;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use controller::{RelayControllerActor, RelayControllerHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{RoomActor, RoomActorHandle, RoomServices};
