//! # Relay Test Utilities
//!
//! Shared test utilities for the room signaling relay and peer client.
//!
//! ## Modules
//!
//! - `mock_peer` - Scripted in-memory peer connections and factory
//! - `mock_stores` - In-memory room directory, account store and chat log
//! - `token_builders` - HS256 access tokens signed with the test secret
//! - `server_harness` - Real relay on a random port with in-memory backends
//! - `ws_client` - WebSocket test client speaking the signaling protocol
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestRelayServer::spawn().await?;
//!     server.directory().with_room("standup", "alice", None, 10);
//!     let token = server.register_user("alice", "Alice");
//!
//!     let mut client = TestClient::connect(&server.ws_url()).await?;
//!     client.authenticate(&token).await?;
//!     client.join("standup", None).await?;
//!     Ok(())
//! }
//! ```

pub mod mock_peer;
pub mod mock_stores;
pub mod server_harness;
pub mod token_builders;
pub mod ws_client;

// Re-export commonly used items
pub use mock_peer::*;
pub use mock_stores::*;
pub use server_harness::*;
pub use token_builders::*;
pub use ws_client::*;
