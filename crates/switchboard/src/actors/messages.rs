//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Response patterns use `tokio::sync::oneshot` for
//! request-reply semantics. Room actors never send into the registry's
//! bounded mailbox; upward notifications use [`RegistryNotice`] on an
//! unbounded channel.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::errors::SwitchboardError;
use crate::store::ParticipantRole;
use signal_protocol::{ParticipantSummary, ServerEvent};

use super::room::RoomActorHandle;

/// Outbound channel to a connected client.
///
/// The gateway owns the receiving half and pumps events onto the socket.
pub type ClientSender = mpsc::Sender<ServerEvent>;

/// Messages sent to `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Create a new room, with the creator as its first participant.
    CreateRoom {
        request: CreateRoomRequest,
        /// Response channel for the room handle and snapshot.
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    },

    /// Join an existing room (live cache first, durable fallback).
    JoinRoom {
        request: JoinRoomRequest,
        /// Response channel for the room handle and snapshot.
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    },

    /// Rejoin an existing room after a disconnect.
    RejoinRoom {
        request: RejoinRoomRequest,
        /// Response channel for the room handle and snapshot.
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    },

    /// Look up a room without joining it.
    FindRoom {
        room_id: String,
        /// Response channel; `None` when the room exists nowhere.
        respond_to: oneshot::Sender<Option<RoomSnapshot>>,
    },

    /// Check room existence and password without joining.
    VerifyRoom {
        room_id: String,
        password: Option<String>,
        /// Response channel for the verification outcome.
        respond_to: oneshot::Sender<VerifyOutcome>,
    },

    /// Close live rooms with no active participants that have been idle
    /// past the cutoff. Responds with the number of rooms closed.
    SweepIdleRooms {
        idle_cutoff: DateTime<Utc>,
        /// Response channel for the sweep count.
        respond_to: oneshot::Sender<usize>,
    },

    /// Get registry statistics (for health/metrics).
    GetStats {
        /// Response channel for statistics.
        respond_to: oneshot::Sender<RegistryStats>,
    },
}

/// Messages sent to a `RoomActor`.
pub enum RoomMessage {
    /// A participant is joining (idempotent upsert by participant id).
    Join {
        participant_id: String,
        display_name: String,
        password: Option<String>,
        sender: ClientSender,
        /// Response channel for the room snapshot.
        respond_to: oneshot::Sender<Result<RoomSnapshot, SwitchboardError>>,
    },

    /// A participant is rejoining under a new connection id.
    Rejoin {
        participant_id: String,
        display_name: Option<String>,
        previous_connection_id: Option<String>,
        sender: ClientSender,
        /// Response channel for the room snapshot.
        respond_to: oneshot::Sender<Result<RoomSnapshot, SwitchboardError>>,
    },

    /// Check the room's password without joining.
    Verify {
        password: Option<String>,
        /// Response channel for the verification outcome.
        respond_to: oneshot::Sender<VerifyOutcome>,
    },

    /// A participant signalled readiness for media negotiation.
    Ready {
        participant_id: String,
        display_name: String,
    },

    /// A participant is leaving explicitly (immediate removal).
    Leave {
        participant_id: String,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), SwitchboardError>>,
    },

    /// A participant's connection dropped (may rejoin within grace).
    Disconnected { participant_id: String },

    /// Relay a signaling message to one participant.
    Relay {
        from: String,
        kind: SignalKind,
        target: String,
        payload: serde_json::Value,
        display_name: Option<String>,
    },

    /// A disconnect grace timer fired for a participant.
    GraceExpired { participant_id: String },

    /// Get current room state (for sweeping/debugging).
    GetState {
        /// Response channel for room state.
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Notices sent from room actors to the registry.
///
/// Delivered on an unbounded channel so a room actor never blocks on the
/// registry.
#[derive(Debug)]
pub enum RegistryNotice {
    /// The room's last participant was removed; the room actor is exiting.
    RoomEmptied { room_id: String },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Request to create a room.
pub struct CreateRoomRequest {
    /// Connection id of the creator (becomes their participant id).
    pub connection_id: String,
    /// Stable identity of the creator, recorded on the room.
    pub creator_identity: String,
    /// Creator's display name.
    pub display_name: String,
    /// Optional room password, stored and compared verbatim.
    pub password: Option<String>,
    /// Optional caller-chosen room id.
    pub requested_id: Option<String>,
    /// Outbound channel to the creator.
    pub sender: ClientSender,
}

/// Request to join a room.
pub struct JoinRoomRequest {
    pub room_id: String,
    /// Connection id of the joiner (becomes their participant id).
    pub connection_id: String,
    pub display_name: String,
    pub password: Option<String>,
    /// Outbound channel to the joiner.
    pub sender: ClientSender,
}

/// Request to rejoin a room after a disconnect.
///
/// Rejoin does not carry a password; a recognized returning participant
/// already proved membership, and an unrecognized one falls back to a
/// fresh join on the same terms.
pub struct RejoinRoomRequest {
    pub room_id: String,
    /// New connection id.
    pub connection_id: String,
    pub display_name: Option<String>,
    /// Connection id from before the disconnect, if the client kept it.
    pub previous_connection_id: Option<String>,
    /// Outbound channel to the rejoiner.
    pub sender: ClientSender,
}

/// A successfully joined room: the snapshot to send back plus the handle
/// the gateway keeps for subsequent operations.
#[derive(Clone)]
pub struct JoinedRoom {
    pub snapshot: RoomSnapshot,
    pub room: RoomActorHandle,
}

/// Client-facing view of a room at a point in time.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: String,
    /// All participants, including inactive ones (flagged).
    pub participants: Vec<ParticipantSummary>,
    pub is_password_protected: bool,
}

/// Outcome of a password verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Whether the room exists (live or durable).
    pub exists: bool,
    /// Whether the supplied password was accepted. Always `false` when
    /// the room does not exist.
    pub password_ok: bool,
}

/// Participant lifecycle status.
///
/// There is no removed state: removal deletes the record outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// Connected and visible to peers.
    Active,
    /// Disconnected, within the rejoin grace window.
    Inactive,
}

/// Signal types the relay forwards verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
        }
    }
}

/// Registry statistics (for health/metrics).
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    /// Live rooms in the cache.
    pub room_count: usize,
    /// Participants across all live rooms, inactive included.
    pub participant_count: usize,
}

/// Current state of a room (for sweeping/debugging).
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub creator_identity: String,
    pub is_password_protected: bool,
    pub participants: Vec<ParticipantDetail>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Detailed participant view (for sweeping/debugging).
#[derive(Debug, Clone)]
pub struct ParticipantDetail {
    pub participant_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    /// Prior connection ids accumulated across rejoin merges, most
    /// recent first.
    pub previous_ids: Vec<String>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_status_equality() {
        assert_eq!(ParticipantStatus::Active, ParticipantStatus::Active);
        assert_ne!(ParticipantStatus::Active, ParticipantStatus::Inactive);
    }

    #[test]
    fn test_signal_kind_labels() {
        assert_eq!(SignalKind::Offer.as_str(), "offer");
        assert_eq!(SignalKind::Answer.as_str(), "answer");
        assert_eq!(SignalKind::IceCandidate.as_str(), "ice_candidate");
    }

    #[test]
    fn test_verify_outcome_copy() {
        let outcome = VerifyOutcome {
            exists: true,
            password_ok: false,
        };
        let copied = outcome;
        assert!(copied.exists);
        assert!(!copied.password_ok);
    }
}
