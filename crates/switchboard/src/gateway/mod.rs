//! WebSocket gateway.
//!
//! The transport edge of the service: accepts WebSocket upgrades on
//! `/ws` and runs one task pair per connection. The read task owns the
//! [`ClientConnection`] dispatch state; the write task pumps outbound
//! [`ServerEvent`]s to the socket. Room broadcasts reach the write task
//! through the same channel handed to the room actor at join time, so a
//! slow client backs up only its own channel.
//!
//! Frames that do not parse as a [`ClientMessage`] are not protocol
//! messages; they are logged and dropped without closing the socket.

pub mod connection;

pub use connection::ClientConnection;

use crate::actors::RoomRegistryHandle;
use crate::sessions::SessionStore;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use signal_protocol::{ClientMessage, ServerEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Buffer size for each connection's outbound event channel. Room actors
/// `try_send` into it and drop on overflow, so this bounds how far a slow
/// client can lag behind its room.
const CLIENT_CHANNEL_BUFFER: usize = 64;

/// Shared state behind the gateway router.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: RoomRegistryHandle,
    pub sessions: SessionStore,
    /// Cancelled at shutdown; open sockets then close promptly.
    pub shutdown: CancellationToken,
}

/// Build the gateway router: the WebSocket endpoint under request tracing.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one connection to completion.
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let GatewayState {
        registry,
        sessions,
        shutdown,
    } = state;

    let (sink, stream) = socket.split();
    let (events, events_rx) = mpsc::channel(CLIENT_CHANNEL_BUFFER);

    let mut connection = ClientConnection::new(registry, sessions, events);
    info!(
        target: "sb.gateway",
        connection_id = %connection.connection_id(),
        "Connection opened"
    );

    let mut writer = tokio::spawn(write_events(events_rx, sink));

    tokio::select! {
        () = read_loop(stream, &mut connection, shutdown) => {}
        // The writer exiting first means the socket rejected a send.
        _ = &mut writer => {}
    }

    connection.handle_disconnect().await;
    writer.abort();

    info!(
        target: "sb.gateway",
        connection_id = %connection.connection_id(),
        room_id = connection.current_room_id().unwrap_or("-"),
        "Connection closed"
    );
}

/// Read frames until the socket or the service goes away.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    connection: &mut ClientConnection,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(
                    target: "sb.gateway",
                    connection_id = %connection.connection_id(),
                    "Shutting down, closing connection"
                );
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => connection.handle_message(message).await,
                            Err(error) => {
                                debug!(
                                    target: "sb.gateway",
                                    connection_id = %connection.connection_id(),
                                    %error,
                                    "Dropping unparseable frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(
                            target: "sb.gateway",
                            connection_id = %connection.connection_id(),
                            "Client closed connection"
                        );
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry no protocol
                        // messages; the ws layer answers pings itself.
                    }
                    Some(Err(error)) => {
                        debug!(
                            target: "sb.gateway",
                            connection_id = %connection.connection_id(),
                            %error,
                            "Transport error, closing connection"
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Pump outbound events to the socket until the channel or socket closes.
async fn write_events(
    mut events: mpsc::Receiver<ServerEvent>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(event) = events.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(error) => {
                warn!(target: "sb.gateway", %error, "Failed to encode event, skipping");
                continue;
            }
        };

        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
