//! Per-connection dispatch.
//!
//! One `ClientConnection` exists per live socket, owned by that socket's
//! read task. It tracks who the connection claims to be (display name,
//! identity, session token) and which room it is in, and translates each
//! inbound [`ClientMessage`] into registry or room calls. Direct replies
//! and room broadcasts travel the same outbound event channel, pumped to
//! the socket by the writer task.
//!
//! # Lifecycle
//!
//! 1. Created on WebSocket upgrade with a fresh connection id
//! 2. Dispatches messages until the socket closes
//! 3. A close without an explicit `leave_room` reports the disconnect to
//!    the current room, which keeps the participant through the grace
//!    window

use crate::actors::{
    ClientSender, CreateRoomRequest, JoinRoomRequest, JoinedRoom, RejoinRoomRequest,
    RoomActorHandle, RoomRegistryHandle, SignalKind,
};
use crate::errors::SwitchboardError;
use crate::sessions::{SessionStore, DEFAULT_DISPLAY_NAME};

use serde_json::Value;
use signal_protocol::{ClientMessage, ServerEvent};
use tracing::{debug, instrument};
use uuid::Uuid;

/// State for one live client connection.
pub struct ClientConnection {
    /// Connection id, reassigned on every transport session.
    connection_id: String,
    registry: RoomRegistryHandle,
    sessions: SessionStore,
    /// Outbound channel toward this client's socket.
    events: ClientSender,
    /// Display name last declared by this client.
    display_name: String,
    /// Stable identity, when the client declared one.
    identity: Option<String>,
    /// Resumption token of the session bound to this connection.
    session_token: Option<String>,
    /// Room this connection is currently in.
    room: Option<RoomActorHandle>,
}

impl ClientConnection {
    /// Create the state for a freshly upgraded socket.
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, sessions: SessionStore, events: ClientSender) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            registry,
            sessions,
            events,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            identity: None,
            session_token: None,
            room: None,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Room id this connection is currently in, if any.
    #[must_use]
    pub fn current_room_id(&self) -> Option<&str> {
        self.room.as_ref().map(RoomActorHandle::room_id)
    }

    /// Dispatch one inbound message.
    #[instrument(
        skip_all,
        name = "sb.gateway",
        fields(connection_id = %self.connection_id, kind = message.kind())
    )]
    pub async fn handle_message(&mut self, message: ClientMessage) {
        debug!(target: "sb.gateway", "Handling client message");

        match message {
            ClientMessage::RestoreSession {
                token,
                identity,
                display_name,
            } => {
                self.handle_restore_session(token, identity, display_name)
                    .await;
            }
            ClientMessage::CreateRoom { password, room_id } => {
                self.handle_create_room(password, room_id).await;
            }
            ClientMessage::JoinRoom {
                room_id,
                password,
                display_name,
            } => {
                self.handle_join_room(room_id, password, display_name).await;
            }
            ClientMessage::RejoinRoom {
                room_id,
                previous_connection_id,
                session_token,
                display_name,
            } => {
                self.handle_rejoin_room(room_id, previous_connection_id, session_token, display_name)
                    .await;
            }
            ClientMessage::Ready {
                room_id,
                display_name,
            } => {
                self.handle_ready(room_id, display_name).await;
            }
            ClientMessage::LeaveRoom => {
                self.handle_leave_room().await;
            }
            ClientMessage::Offer {
                target,
                payload,
                display_name,
            } => {
                self.handle_relay(SignalKind::Offer, target, payload, display_name)
                    .await;
            }
            ClientMessage::Answer {
                target,
                payload,
                display_name,
            } => {
                self.handle_relay(SignalKind::Answer, target, payload, display_name)
                    .await;
            }
            ClientMessage::IceCandidate {
                target,
                payload,
                display_name,
            } => {
                self.handle_relay(SignalKind::IceCandidate, target, payload, display_name)
                    .await;
            }
        }
    }

    /// Transport closed without an explicit leave.
    ///
    /// The room keeps the participant through the grace window so a rejoin
    /// can reclaim the seat; the session stays for the sweeper.
    pub async fn handle_disconnect(&self) {
        if let Some(room) = &self.room {
            debug!(
                target: "sb.gateway",
                connection_id = %self.connection_id,
                room_id = %room.room_id(),
                "Connection dropped while in a room"
            );
            room.disconnected(self.connection_id.clone()).await;
        }
    }

    async fn handle_restore_session(
        &mut self,
        token: Option<String>,
        identity: Option<String>,
        display_name: Option<String>,
    ) {
        let (session, created) = self
            .sessions
            .resolve_or_create(
                token.as_deref(),
                identity.as_deref(),
                display_name.as_deref(),
                &self.connection_id,
            )
            .await;

        self.display_name = session.display_name.clone();
        self.identity = session.identity.clone();
        self.session_token = Some(session.session_id.clone());

        let event = if created {
            ServerEvent::SessionCreated {
                token: session.session_id,
                identity: session.identity,
                display_name: session.display_name,
                room_id: session.current_room_id,
            }
        } else {
            ServerEvent::SessionRestored {
                token: session.session_id,
                identity: session.identity,
                display_name: session.display_name,
                room_id: session.current_room_id,
            }
        };
        self.send(event).await;
    }

    async fn handle_create_room(&mut self, password: Option<String>, requested_id: Option<String>) {
        // An unauthenticated creator's identity is their self-declared name.
        let creator_identity = self
            .identity
            .clone()
            .unwrap_or_else(|| self.display_name.clone());

        let request = CreateRoomRequest {
            connection_id: self.connection_id.clone(),
            creator_identity,
            display_name: self.display_name.clone(),
            password,
            requested_id,
            sender: self.events.clone(),
        };

        match self.registry.create_room(request).await {
            Ok(joined) => self.enter_room(joined, true).await,
            Err(error) => self.send_error(&error).await,
        }
    }

    async fn handle_join_room(
        &mut self,
        room_id: String,
        password: Option<String>,
        display_name: String,
    ) {
        if !display_name.is_empty() {
            self.display_name = display_name;
        }

        let request = JoinRoomRequest {
            room_id,
            connection_id: self.connection_id.clone(),
            display_name: self.display_name.clone(),
            password,
            sender: self.events.clone(),
        };

        match self.registry.join_room(request).await {
            Ok(joined) => self.enter_room(joined, false).await,
            Err(error) => self.send_error(&error).await,
        }
    }

    async fn handle_rejoin_room(
        &mut self,
        room_id: String,
        previous_connection_id: Option<String>,
        session_token: Option<String>,
        display_name: Option<String>,
    ) {
        // A rejoin may carry a resumption token as its only evidence. When
        // this connection has no session yet, resolve it first so the
        // stored display name can drive the room's recognition.
        if self.session_token.is_none() && session_token.is_some() {
            let (session, created) = self
                .sessions
                .resolve_or_create(
                    session_token.as_deref(),
                    None,
                    display_name.as_deref(),
                    &self.connection_id,
                )
                .await;
            if !created {
                debug!(
                    target: "sb.gateway",
                    connection_id = %self.connection_id,
                    "Recovered session from rejoin token"
                );
            }
            self.display_name = session.display_name;
            self.identity = session.identity;
            self.session_token = Some(session.session_id);
        } else if let Some(name) = display_name.filter(|name| !name.is_empty()) {
            self.display_name = name;
        }

        let request = RejoinRoomRequest {
            room_id,
            connection_id: self.connection_id.clone(),
            display_name: Some(self.display_name.clone()),
            previous_connection_id,
            sender: self.events.clone(),
        };

        match self.registry.rejoin_room(request).await {
            Ok(joined) => self.enter_room(joined, false).await,
            Err(error) => self.send_error(&error).await,
        }
    }

    async fn handle_ready(&mut self, room_id: String, display_name: String) {
        let Some(room) = self.current_room(&room_id) else {
            self.send_error(&SwitchboardError::NotInRoom).await;
            return;
        };

        if !display_name.is_empty() {
            self.display_name = display_name;
        }

        // Readiness marks real activity; keep the session from idling out
        // during a long call.
        if let Some(token) = &self.session_token {
            self.sessions.touch(token).await;
        }

        room.ready(self.connection_id.clone(), self.display_name.clone())
            .await;
    }

    async fn handle_leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            self.send_error(&SwitchboardError::NotInRoom).await;
            return;
        };

        match room.leave(self.connection_id.clone()).await {
            Ok(()) => {
                debug!(
                    target: "sb.gateway",
                    connection_id = %self.connection_id,
                    room_id = %room.room_id(),
                    "Left room"
                );
                self.bind_session_room(None).await;
            }
            Err(error) => self.send_error(&error).await,
        }
    }

    async fn handle_relay(
        &self,
        kind: SignalKind,
        target: String,
        payload: Value,
        display_name: Option<String>,
    ) {
        let Some(room) = &self.room else {
            self.send_error(&SwitchboardError::NotInRoom).await;
            return;
        };

        room.relay(
            self.connection_id.clone(),
            kind,
            target,
            payload,
            display_name,
        )
        .await;
    }

    /// Record a successful room entry and reply with the snapshot.
    async fn enter_room(&mut self, joined: JoinedRoom, created: bool) {
        let JoinedRoom { snapshot, room } = joined;

        // A connection drives at most one membership. Entering a new room
        // detaches the old one through the normal disconnect transition.
        if let Some(previous) = self.room.take() {
            if previous.room_id() != snapshot.room_id {
                previous.disconnected(self.connection_id.clone()).await;
            }
        }

        self.bind_session_room(Some(snapshot.room_id.clone())).await;
        self.room = Some(room);

        let event = if created {
            ServerEvent::RoomCreated {
                room_id: snapshot.room_id,
                participants: snapshot.participants,
                is_password_protected: snapshot.is_password_protected,
            }
        } else {
            ServerEvent::RoomJoined {
                room_id: snapshot.room_id,
                participants: snapshot.participants,
                is_password_protected: snapshot.is_password_protected,
            }
        };
        self.send(event).await;
    }

    async fn bind_session_room(&self, room_id: Option<String>) {
        if let Some(token) = &self.session_token {
            self.sessions.bind_room(token, room_id).await;
        }
    }

    async fn send(&self, event: ServerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(
                target: "sb.gateway",
                connection_id = %self.connection_id,
                "Client event channel closed, dropping reply"
            );
        }
    }

    async fn send_error(&self, error: &SwitchboardError) {
        debug!(
            target: "sb.gateway",
            connection_id = %self.connection_id,
            %error,
            "Rejecting client request"
        );
        self.send(ServerEvent::RoomError {
            code: error.code(),
            message: error.client_message(),
        })
        .await;
    }

    fn current_room(&self, room_id: &str) -> Option<RoomActorHandle> {
        self.room
            .as_ref()
            .filter(|room| room.room_id() == room_id)
            .cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::RoomRegistryActor;
    use crate::observability::AnalyticsPublisher;
    use crate::store::SharedStore;
    use sb_test_utils::MemoryStore;
    use serde_json::json;
    use signal_protocol::RoomErrorCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct TestGateway {
        registry: RoomRegistryHandle,
        sessions: SessionStore,
    }

    fn gateway() -> TestGateway {
        let store = Arc::new(MemoryStore::new());
        let (registry, _task) = RoomRegistryActor::spawn(
            Arc::clone(&store) as SharedStore,
            AnalyticsPublisher::disabled(),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let sessions = SessionStore::new(store as SharedStore);
        TestGateway { registry, sessions }
    }

    fn connect(gw: &TestGateway) -> (ClientConnection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let connection = ClientConnection::new(gw.registry.clone(), gw.sessions.clone(), tx);
        (connection, rx)
    }

    async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("client channel closed")
    }

    async fn restore(conn: &mut ClientConnection, name: &str) {
        conn.handle_message(ClientMessage::RestoreSession {
            token: None,
            identity: None,
            display_name: Some(name.to_string()),
        })
        .await;
    }

    /// Restore + create + drain the two replies; returns the room id.
    async fn create_room(
        conn: &mut ClientConnection,
        rx: &mut mpsc::Receiver<ServerEvent>,
        name: &str,
    ) -> String {
        restore(conn, name).await;
        let _session = recv_event(rx).await;

        conn.handle_message(ClientMessage::CreateRoom {
            password: None,
            room_id: None,
        })
        .await;
        match recv_event(rx).await {
            ServerEvent::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room_created, got {other:?}"),
        }
    }

    async fn join_room(
        conn: &mut ClientConnection,
        rx: &mut mpsc::Receiver<ServerEvent>,
        room_id: &str,
        name: &str,
    ) {
        conn.handle_message(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            password: None,
            display_name: name.to_string(),
        })
        .await;
        match recv_event(rx).await {
            ServerEvent::RoomJoined { .. } => {}
            other => panic!("expected room_joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_session_creates_session() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        restore(&mut conn, "Alicia").await;

        let event = recv_event(&mut rx).await;
        match event {
            ServerEvent::SessionCreated {
                token,
                identity,
                display_name,
                room_id,
            } => {
                assert!(!token.is_empty());
                assert_eq!(identity, None);
                assert_eq!(display_name, "Alicia");
                assert_eq!(room_id, None);
            }
            other => panic!("expected session_created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_session_restores_by_token() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);

        restore(&mut conn1, "Alicia").await;
        let token = match recv_event(&mut rx1).await {
            ServerEvent::SessionCreated { token, .. } => token,
            other => panic!("expected session_created, got {other:?}"),
        };

        let (mut conn2, mut rx2) = connect(&gw);
        conn2
            .handle_message(ClientMessage::RestoreSession {
                token: Some(token.clone()),
                identity: None,
                display_name: None,
            })
            .await;

        let event = recv_event(&mut rx2).await;
        match event {
            ServerEvent::SessionRestored {
                token: restored,
                display_name,
                room_id,
                ..
            } => {
                assert_eq!(restored, token);
                assert_eq!(display_name, "Alicia");
                assert_eq!(room_id, None);
            }
            other => panic!("expected session_restored, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_room_replies_room_created() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        restore(&mut conn, "Alicia").await;
        let _session = recv_event(&mut rx).await;

        conn.handle_message(ClientMessage::CreateRoom {
            password: None,
            room_id: None,
        })
        .await;

        let event = recv_event(&mut rx).await;
        match event {
            ServerEvent::RoomCreated {
                room_id,
                participants,
                is_password_protected,
            } => {
                assert_eq!(room_id.len(), 6);
                // The creator's own snapshot lists the others, and there
                // are none yet.
                assert!(participants.is_empty());
                assert!(!is_password_protected);
                assert_eq!(conn.current_room_id(), Some(room_id.as_str()));
            }
            other => panic!("expected room_created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_room_without_session() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        // No restore_session first; the default display name stands in
        // for the identity.
        conn.handle_message(ClientMessage::CreateRoom {
            password: None,
            room_id: None,
        })
        .await;

        let event = recv_event(&mut rx).await;
        assert!(matches!(event, ServerEvent::RoomCreated { .. }), "got {event:?}");
    }

    #[tokio::test]
    async fn test_join_room_notifies_creator() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        conn2
            .handle_message(ClientMessage::JoinRoom {
                room_id: room_id.clone(),
                password: None,
                display_name: "Bob".to_string(),
            })
            .await;

        match recv_event(&mut rx2).await {
            ServerEvent::RoomJoined {
                room_id: joined_id,
                participants,
                ..
            } => {
                assert_eq!(joined_id, room_id);
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].user_id, conn1.connection_id());
                assert_eq!(participants[0].display_name, "Alicia");
            }
            other => panic!("expected room_joined, got {other:?}"),
        }

        match recv_event(&mut rx1).await {
            ServerEvent::UserJoined {
                user_id,
                display_name,
            } => {
                assert_eq!(user_id, conn2.connection_id());
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected user_joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_room_wrong_password_errors() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);

        restore(&mut conn1, "Alicia").await;
        let _session = recv_event(&mut rx1).await;
        conn1
            .handle_message(ClientMessage::CreateRoom {
                password: Some("1234".to_string()),
                room_id: None,
            })
            .await;
        let room_id = match recv_event(&mut rx1).await {
            ServerEvent::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room_created, got {other:?}"),
        };

        let (mut conn2, mut rx2) = connect(&gw);
        conn2
            .handle_message(ClientMessage::JoinRoom {
                room_id,
                password: Some("9999".to_string()),
                display_name: "Bob".to_string(),
            })
            .await;

        match recv_event(&mut rx2).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::IncorrectPassword);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
        assert_eq!(conn2.current_room_id(), None);
    }

    #[tokio::test]
    async fn test_join_missing_room_errors() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        conn.handle_message(ClientMessage::JoinRoom {
            room_id: "NOSUCH".to_string(),
            password: None,
            display_name: "Bob".to_string(),
        })
        .await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::RoomNotFound);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ready_requires_room() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        conn.handle_message(ClientMessage::Ready {
            room_id: "X7Q2LD".to_string(),
            display_name: "Bob".to_string(),
        })
        .await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::NotInRoom);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ready_for_other_room_rejected() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);
        let _room_id = create_room(&mut conn, &mut rx, "Alicia").await;

        conn.handle_message(ClientMessage::Ready {
            room_id: "OTHER1".to_string(),
            display_name: "Alicia".to_string(),
        })
        .await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::NotInRoom);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ready_triggers_initiate_offer() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        join_room(&mut conn2, &mut rx2, &room_id, "Bob").await;
        let _user_joined = recv_event(&mut rx1).await;

        conn2
            .handle_message(ClientMessage::Ready {
                room_id,
                display_name: "Bob".to_string(),
            })
            .await;

        match recv_event(&mut rx1).await {
            ServerEvent::InitiateOffer {
                target,
                display_name,
            } => {
                assert_eq!(target, conn2.connection_id());
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected initiate-offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_room_requires_room() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        conn.handle_message(ClientMessage::LeaveRoom).await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::NotInRoom);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_room_clears_binding() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        restore(&mut conn, "Alicia").await;
        let token = match recv_event(&mut rx).await {
            ServerEvent::SessionCreated { token, .. } => token,
            other => panic!("expected session_created, got {other:?}"),
        };

        conn.handle_message(ClientMessage::CreateRoom {
            password: None,
            room_id: None,
        })
        .await;
        let room_id = match recv_event(&mut rx).await {
            ServerEvent::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room_created, got {other:?}"),
        };

        conn.handle_message(ClientMessage::LeaveRoom).await;
        assert_eq!(conn.current_room_id(), None);

        // Sole participant left, so the room is gone.
        assert!(gw.registry.find_room(room_id).await.is_none());

        // The session's last-room binding is cleared too.
        let (mut conn2, mut rx2) = connect(&gw);
        conn2
            .handle_message(ClientMessage::RestoreSession {
                token: Some(token),
                identity: None,
                display_name: None,
            })
            .await;
        match recv_event(&mut rx2).await {
            ServerEvent::SessionRestored { room_id, .. } => assert_eq!(room_id, None),
            other => panic!("expected session_restored, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relay_requires_room() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        conn.handle_message(ClientMessage::Offer {
            target: "conn-2".to_string(),
            payload: json!({"sdp": "v=0..."}),
            display_name: None,
        })
        .await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::NotInRoom);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_relayed_to_target() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        join_room(&mut conn2, &mut rx2, &room_id, "Bob").await;
        let _user_joined = recv_event(&mut rx1).await;

        let payload = json!({"sdp": "v=0...", "type": "offer"});
        conn2
            .handle_message(ClientMessage::Offer {
                target: conn1.connection_id().to_string(),
                payload: payload.clone(),
                display_name: None,
            })
            .await;

        match recv_event(&mut rx1).await {
            ServerEvent::Offer {
                from,
                payload: relayed,
                display_name,
            } => {
                assert_eq!(from, conn2.connection_id());
                assert_eq!(relayed, payload);
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_marks_inactive() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        join_room(&mut conn2, &mut rx2, &room_id, "Bob").await;
        let _user_joined = recv_event(&mut rx1).await;

        conn2.handle_disconnect().await;

        match recv_event(&mut rx1).await {
            ServerEvent::UserInactive { user_id, .. } => {
                assert_eq!(user_id, conn2.connection_id());
            }
            other => panic!("expected user_inactive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_with_previous_id() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        join_room(&mut conn2, &mut rx2, &room_id, "Bob").await;
        let _user_joined = recv_event(&mut rx1).await;

        conn2.handle_disconnect().await;
        let _user_inactive = recv_event(&mut rx1).await;

        let (mut conn3, mut rx3) = connect(&gw);
        conn3
            .handle_message(ClientMessage::RejoinRoom {
                room_id: room_id.clone(),
                previous_connection_id: Some(conn2.connection_id().to_string()),
                session_token: None,
                display_name: Some("Bob".to_string()),
            })
            .await;

        match recv_event(&mut rx3).await {
            ServerEvent::RoomJoined {
                room_id: joined_id,
                participants,
                ..
            } => {
                assert_eq!(joined_id, room_id);
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].user_id, conn1.connection_id());
            }
            other => panic!("expected room_joined, got {other:?}"),
        }

        match recv_event(&mut rx1).await {
            ServerEvent::UserRejoined {
                user_id,
                display_name,
            } => {
                assert_eq!(user_id, conn3.connection_id());
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected user_rejoined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_with_session_token_adopts_name() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let room_id = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        restore(&mut conn2, "Bobby").await;
        let token = match recv_event(&mut rx2).await {
            ServerEvent::SessionCreated { token, .. } => token,
            other => panic!("expected session_created, got {other:?}"),
        };
        join_room(&mut conn2, &mut rx2, &room_id, "Bobby").await;
        let _user_joined = recv_event(&mut rx1).await;

        conn2.handle_disconnect().await;
        let _user_inactive = recv_event(&mut rx1).await;

        // The new connection brings only the resumption token; the stored
        // display name drives recognition.
        let (mut conn3, mut rx3) = connect(&gw);
        conn3
            .handle_message(ClientMessage::RejoinRoom {
                room_id,
                previous_connection_id: None,
                session_token: Some(token),
                display_name: None,
            })
            .await;

        match recv_event(&mut rx3).await {
            ServerEvent::RoomJoined { .. } => {}
            other => panic!("expected room_joined, got {other:?}"),
        }

        match recv_event(&mut rx1).await {
            ServerEvent::UserRejoined {
                user_id,
                display_name,
            } => {
                assert_eq!(user_id, conn3.connection_id());
                assert_eq!(display_name, "Bobby");
            }
            other => panic!("expected user_rejoined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_missing_room_errors() {
        let gw = gateway();
        let (mut conn, mut rx) = connect(&gw);

        conn.handle_message(ClientMessage::RejoinRoom {
            room_id: "NOSUCH".to_string(),
            previous_connection_id: Some("conn-old".to_string()),
            session_token: None,
            display_name: Some("Bob".to_string()),
        })
        .await;

        match recv_event(&mut rx).await {
            ServerEvent::RoomError { code, .. } => {
                assert_eq!(code, RoomErrorCode::RoomNotFound);
            }
            other => panic!("expected room_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_second_room_detaches_first() {
        let gw = gateway();
        let (mut conn1, mut rx1) = connect(&gw);
        let first_room = create_room(&mut conn1, &mut rx1, "Alicia").await;

        let (mut conn2, mut rx2) = connect(&gw);
        let second_room = create_room(&mut conn2, &mut rx2, "Bob").await;

        join_room(&mut conn1, &mut rx1, &second_room, "Alicia").await;
        assert_eq!(conn1.current_room_id(), Some(second_room.as_str()));

        // The first membership went inactive through the disconnect path.
        let snapshot = gw
            .registry
            .find_room(first_room)
            .await
            .expect("first room should still exist");
        assert_eq!(snapshot.participants.len(), 1);
        assert!(snapshot.participants[0].inactive);
    }
}
