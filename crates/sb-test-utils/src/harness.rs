//! Gateway test harness.
//!
//! Drives the gateway dispatch layer against a live room registry without
//! sockets. Each [`TestClient`] stands in for one connected client: messages
//! go straight into the dispatch layer and server events come back through
//! the same bounded channel a real connection would use, so event ordering
//! and overflow behavior match production.
//!
//! # Example
//!
//! ```rust,ignore
//! use sb_test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_join_flow() {
//!     let harness = TestHarness::new();
//!     let mut alice = harness.connect();
//!     let mut bob = harness.connect();
//!
//!     alice.start_session("Alice").await;
//!     let room_id = alice.create_room().await;
//!     bob.join_room(&room_id, "Bob").await;
//!
//!     harness.shutdown().await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use signal_protocol::{ClientMessage, ParticipantSummary, ServerEvent};
use switchboard::actors::{RoomRegistryActor, RoomRegistryHandle};
use switchboard::gateway::ClientConnection;
use switchboard::observability::AnalyticsPublisher;
use switchboard::sessions::SessionStore;
use switchboard::store::SharedStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::MemoryStore;

/// Disconnect grace period used unless a test overrides it.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Per-client event buffer; matches the gateway's per-connection size.
const EVENT_BUFFER: usize = 64;

/// How long [`TestClient::recv`] waits before failing the test.
const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the harness waits for the registry to drain on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running registry, session store, and memory store for one test.
pub struct TestHarness {
    store: MemoryStore,
    registry: RoomRegistryHandle,
    registry_task: JoinHandle<()>,
    sessions: SessionStore,
    cancel_token: CancellationToken,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Start a harness with an empty store and the default grace period.
    #[must_use]
    pub fn new() -> Self {
        Self::build(MemoryStore::new(), DEFAULT_GRACE_PERIOD)
    }

    /// Start a harness with a custom disconnect grace period.
    #[must_use]
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self::build(MemoryStore::new(), grace_period)
    }

    /// Start a harness over a pre-seeded store, as if the service had
    /// restarted with durable state behind it.
    #[must_use]
    pub fn with_store(store: MemoryStore) -> Self {
        Self::build(store, DEFAULT_GRACE_PERIOD)
    }

    fn build(store: MemoryStore, grace_period: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let shared: SharedStore = Arc::new(store.clone());

        let (registry, registry_task) = RoomRegistryActor::spawn(
            Arc::clone(&shared),
            AnalyticsPublisher::disabled(),
            grace_period,
            cancel_token.child_token(),
        );
        let sessions = SessionStore::new(shared);

        Self {
            store,
            registry,
            registry_task,
            sessions,
            cancel_token,
        }
    }

    /// The harness's memory store, for seeding and persistence assertions.
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Open a new client, as if a socket had just connected.
    #[must_use]
    pub fn connect(&self) -> TestClient {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let connection =
            ClientConnection::new(self.registry.clone(), self.sessions.clone(), events);
        TestClient {
            connection,
            events: events_rx,
        }
    }

    /// Cancel the registry and wait for it to drain its rooms.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        tokio::time::timeout(SHUTDOWN_TIMEOUT, self.registry_task)
            .await
            .expect("registry did not stop within the shutdown timeout")
            .expect("registry task panicked");
    }
}

/// One simulated client connection.
///
/// Wraps the real dispatch state plus the receiving half of its event
/// channel. Messages are dispatched inline, so by the time `send` returns
/// the room actor has the request in its mailbox.
pub struct TestClient {
    connection: ClientConnection,
    events: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    #[must_use]
    pub fn connection_id(&self) -> String {
        self.connection.connection_id().to_string()
    }

    /// Dispatch one client message.
    pub async fn send(&mut self, message: ClientMessage) {
        self.connection.handle_message(message).await;
    }

    /// Simulate the transport dropping.
    pub async fn disconnect(&self) {
        self.connection.handle_disconnect().await;
    }

    /// Receive the next server event, failing the test after a timeout.
    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for a server event")
            .expect("event channel closed")
    }

    /// Receive the next server event if one arrives within `window`.
    pub async fn recv_within(&mut self, window: Duration) -> Option<ServerEvent> {
        match tokio::time::timeout(window, self.events.recv()).await {
            Ok(event) => Some(event.expect("event channel closed")),
            Err(_) => None,
        }
    }

    /// Assert that no event arrives for a short window.
    pub async fn expect_no_event(&mut self) {
        if let Some(event) = self.recv_within(Duration::from_millis(100)).await {
            panic!("expected silence, got {event:?}");
        }
    }

    /// Collect events until the channel goes quiet.
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv_within(Duration::from_millis(50)).await {
            events.push(event);
        }
        events
    }

    /// Create a fresh session and return its resumption token.
    pub async fn start_session(&mut self, display_name: &str) -> String {
        self.send(ClientMessage::RestoreSession {
            token: None,
            identity: None,
            display_name: Some(display_name.to_string()),
        })
        .await;
        match self.recv().await {
            ServerEvent::SessionCreated { token, .. } => token,
            other => panic!("expected session-created, got {other:?}"),
        }
    }

    /// Create an open room with a generated id and return the id.
    pub async fn create_room(&mut self) -> String {
        self.create_room_with(None, None).await
    }

    /// Create a room, optionally password-protected or with a chosen id.
    pub async fn create_room_with(
        &mut self,
        password: Option<&str>,
        room_id: Option<&str>,
    ) -> String {
        self.send(ClientMessage::CreateRoom {
            password: password.map(ToString::to_string),
            room_id: room_id.map(ToString::to_string),
        })
        .await;
        match self.recv().await {
            ServerEvent::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room-created, got {other:?}"),
        }
    }

    /// Join an open room and return the participant snapshot.
    pub async fn join_room(&mut self, room_id: &str, display_name: &str) -> Vec<ParticipantSummary> {
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            password: None,
            display_name: display_name.to_string(),
        })
        .await;
        match self.recv().await {
            ServerEvent::RoomJoined { participants, .. } => participants,
            other => panic!("expected room-joined, got {other:?}"),
        }
    }
}
