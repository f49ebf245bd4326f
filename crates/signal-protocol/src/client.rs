//! Client-to-server messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message sent by a client over its signaling connection.
///
/// Every inbound frame is one of these variants; anything that fails to
/// parse is not a protocol message and is dropped by the gateway. Optional
/// fields deserialize to `None` when absent so older clients stay
/// compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Resolve an existing session by resumption token, or create a new one.
    ///
    /// Sent once, before any room operation. An unknown token is not an
    /// error; the server degrades to creating a fresh session.
    #[serde(rename_all = "camelCase")]
    RestoreSession {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        identity: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Create a new room, optionally password-protected, optionally with a
    /// caller-chosen room id. The creator joins the room implicitly.
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        room_id: Option<String>,
    },

    /// Join an existing room as a new participant.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        password: Option<String>,
        display_name: String,
    },

    /// Re-enter a room after a disconnect, carrying whatever evidence of the
    /// previous membership the client still has.
    #[serde(rename_all = "camelCase")]
    RejoinRoom {
        room_id: String,
        #[serde(default)]
        previous_connection_id: Option<String>,
        #[serde(default)]
        session_token: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Announce readiness to receive negotiation. The server answers by
    /// directing every other active participant to initiate an offer.
    #[serde(rename_all = "camelCase")]
    Ready {
        room_id: String,
        display_name: String,
    },

    /// Leave the current room explicitly.
    LeaveRoom,

    /// Relay an SDP offer to one participant in the same room.
    #[serde(rename_all = "camelCase")]
    Offer {
        target: String,
        payload: Value,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Relay an SDP answer to one participant in the same room.
    #[serde(rename_all = "camelCase")]
    Answer {
        target: String,
        payload: Value,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Relay an ICE candidate to one participant in the same room.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: String,
        payload: Value,
        #[serde(default)]
        display_name: Option<String>,
    },
}

impl ClientMessage {
    /// Wire tag for this message, for logging and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RestoreSession { .. } => "restore_session",
            Self::CreateRoom { .. } => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::RejoinRoom { .. } => "rejoin_room",
            Self::Ready { .. } => "ready",
            Self::LeaveRoom => "leave_room",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
        }
    }
}
