//! Test server harness for end-to-end testing.
//!
//! Provides `TestRelayServer`: the real relay router and actor system on a
//! random port, wired to in-memory backends.

use crate::mock_stores::{MockAccountStore, MockChatLog, MockRoomDirectory};
use crate::token_builders::{TestTokenBuilder, TEST_JWT_SECRET};
use common::secret::SecretString;
use relay_service::actors::{ActorMetrics, RelayControllerHandle, RoomServices};
use relay_service::auth::JwtCredentialValidator;
use relay_service::registry::InMemoryRegistry;
use relay_service::session::RelayContext;
use relay_service::ws::relay_router;
use signaling_protocol::{IceServer, DEFAULT_MAX_MESSAGE_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Tunables for a test relay.
#[derive(Debug, Clone)]
pub struct TestRelayOptions {
    pub participant_ttl: Duration,
    pub auth_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for TestRelayOptions {
    fn default() -> Self {
        Self {
            participant_ttl: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(5),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Test harness for spawning a relay in E2E tests
///
/// # Example
/// ```rust,ignore
/// let server = TestRelayServer::spawn().await?;
/// server.directory().with_room("standup", "alice", None, 10);
/// let token = server.register_user("alice", "Alice");
/// let mut client = TestClient::connect(&server.ws_url()).await?;
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    directory: MockRoomDirectory,
    accounts: MockAccountStore,
    chat_log: MockChatLog,
    registry: Arc<InMemoryRegistry>,
    controller: RelayControllerHandle,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a relay with default options.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(TestRelayOptions::default()).await
    }

    /// Spawn a relay bound to 127.0.0.1 on a random port.
    pub async fn spawn_with(options: TestRelayOptions) -> Result<Self, anyhow::Error> {
        let directory = MockRoomDirectory::new();
        let accounts = MockAccountStore::new();
        let chat_log = MockChatLog::new();
        let registry = Arc::new(InMemoryRegistry::new(options.participant_ttl));

        let metrics = ActorMetrics::new();
        let controller = RelayControllerHandle::new(
            "relay-test".to_string(),
            RoomServices {
                registry: registry.clone(),
                directory: Arc::new(directory.clone()),
                chat_log: Arc::new(chat_log.clone()),
                participant_ttl: options.participant_ttl,
            },
            Arc::clone(&metrics),
        );

        let context = Arc::new(RelayContext {
            controller: controller.clone(),
            validator: Arc::new(JwtCredentialValidator::new(
                &SecretString::from(TEST_JWT_SECRET.to_string()),
                Duration::from_secs(300),
                Arc::new(accounts.clone()),
            )),
            directory: Arc::new(directory.clone()),
            registry: registry.clone(),
            metrics,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.test.invalid:3478".to_string()],
                username: None,
                credential: None,
            }],
            max_message_bytes: options.max_message_bytes,
            auth_timeout: options.auth_timeout,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let app = relay_router(context);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            directory,
            accounts,
            chat_log,
            registry,
            controller,
            _handle: handle,
        })
    }

    /// WebSocket URL of the relay endpoint
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn directory(&self) -> &MockRoomDirectory {
        &self.directory
    }

    pub fn accounts(&self) -> &MockAccountStore {
        &self.accounts
    }

    pub fn chat_log(&self) -> &MockChatLog {
        &self.chat_log
    }

    /// The session registry the relay writes to
    pub fn registry(&self) -> &Arc<InMemoryRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &RelayControllerHandle {
        &self.controller
    }

    /// Create an active account and return a valid token for it
    pub fn register_user(&self, user_id: &str, display_name: &str) -> String {
        self.accounts.with_user(user_id, display_name);
        TestTokenBuilder::new().for_user(user_id).build()
    }
}
