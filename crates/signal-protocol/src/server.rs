//! Server-to-client events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One participant as listed in `room_created` / `room_joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: String,
    pub display_name: String,
    /// True for a participant inside its disconnect grace window (or
    /// rehydrated from the durable store and not yet rejoined).
    #[serde(default)]
    pub inactive: bool,
}

/// Error codes carried by `room_error`.
///
/// The spelling of each code is part of the wire contract, including the
/// legacy upper-case `NOT_IN_ROOM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomErrorCode {
    RoomNotFound,
    IncorrectPassword,
    JoinError,
    #[serde(rename = "NOT_IN_ROOM")]
    NotInRoom,
}

impl RoomErrorCode {
    /// Wire spelling of this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::IncorrectPassword => "incorrect_password",
            Self::JoinError => "join_error",
            Self::NotInRoom => "NOT_IN_ROOM",
        }
    }
}

impl std::fmt::Display for RoomErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message sent by the server to one client.
///
/// Directed replies (session/room results, relayed payloads) and room
/// broadcasts (`user_*`) share this one enum so the per-connection outbound
/// channel carries a single type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A fresh session was created for this connection.
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        token: String,
        identity: Option<String>,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// An existing session was resumed; `room_id` is the last room this
    /// session was in, when the server still remembers one.
    #[serde(rename_all = "camelCase")]
    SessionRestored {
        token: String,
        identity: Option<String>,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: String,
        participants: Vec<ParticipantSummary>,
        is_password_protected: bool,
    },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        participants: Vec<ParticipantSummary>,
        is_password_protected: bool,
    },

    #[serde(rename_all = "camelCase")]
    RoomError { code: RoomErrorCode, message: String },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, display_name: String },

    #[serde(rename_all = "camelCase")]
    UserRejoined { user_id: String, display_name: String },

    #[serde(rename_all = "camelCase")]
    UserInactive { user_id: String, display_name: String },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String, display_name: String },

    #[serde(rename_all = "camelCase")]
    UserUpdated { user_id: String, display_name: String },

    /// Directed instruction to start negotiation toward `target`, emitted to
    /// every other active participant when someone signals `ready`.
    #[serde(rename = "initiate-offer", rename_all = "camelCase")]
    InitiateOffer { target: String, display_name: String },

    /// Relayed SDP offer.
    #[serde(rename_all = "camelCase")]
    Offer {
        from: String,
        payload: Value,
        display_name: String,
    },

    /// Relayed SDP answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        from: String,
        payload: Value,
        display_name: String,
    },

    /// Relayed ICE candidate. Outbound uses the hyphenated legacy tag.
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        from: String,
        payload: Value,
        display_name: String,
    },
}

impl ServerEvent {
    /// Wire tag for this event, for logging and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionRestored { .. } => "session_restored",
            Self::RoomCreated { .. } => "room_created",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomError { .. } => "room_error",
            Self::UserJoined { .. } => "user_joined",
            Self::UserRejoined { .. } => "user_rejoined",
            Self::UserInactive { .. } => "user_inactive",
            Self::UserLeft { .. } => "user_left",
            Self::UserUpdated { .. } => "user_updated",
            Self::InitiateOffer { .. } => "initiate-offer",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}
