//! Redis backends.
//!
//! The session registry and every collaborator store share one multiplexed
//! connection. See [`lua_scripts`] for the registry key layout.

mod accounts;
mod chat;
mod client;
mod directory;
pub mod lua_scripts;
mod registry;

pub use accounts::RedisAccountStore;
pub use chat::{RedisChatLog, CHAT_HISTORY_LIMIT};
pub use client::RedisConnection;
pub use directory::{RedisRoomDirectory, DEFAULT_MAX_PARTICIPANTS};
pub use registry::RedisSessionRegistry;
