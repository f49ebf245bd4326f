//! Pre-built store records for seeding tests.
//!
//! All fixtures use fresh timestamps; tests that care about age adjust the
//! fields directly before seeding.

use chrono::Utc;
use switchboard::store::{ParticipantRecord, ParticipantRole, RoomRecord, SessionRecord};

/// An empty open room record created just now.
#[must_use]
pub fn room_record(room_id: &str, creator_identity: &str) -> RoomRecord {
    let now = Utc::now();
    RoomRecord {
        room_id: room_id.to_string(),
        creator_identity: creator_identity.to_string(),
        password: None,
        created_at: now,
        last_active_at: now,
        participants: Vec::new(),
    }
}

/// A room record protected by `password`.
#[must_use]
pub fn protected_room_record(room_id: &str, creator_identity: &str, password: &str) -> RoomRecord {
    RoomRecord {
        password: Some(password.to_string()),
        ..room_record(room_id, creator_identity)
    }
}

/// An active participant record.
#[must_use]
pub fn participant_record(
    user_id: &str,
    display_name: &str,
    role: ParticipantRole,
) -> ParticipantRecord {
    ParticipantRecord {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        joined_at: Utc::now(),
        role,
        inactive: false,
        disconnected_at: None,
        previous_id: None,
    }
}

/// A member record already sitting in the disconnect grace window.
#[must_use]
pub fn inactive_participant_record(user_id: &str, display_name: &str) -> ParticipantRecord {
    ParticipantRecord {
        inactive: true,
        disconnected_at: Some(Utc::now()),
        ..participant_record(user_id, display_name, ParticipantRole::Member)
    }
}

/// A session record created just now, with no external identity.
#[must_use]
pub fn session_record(session_id: &str, display_name: &str) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        session_id: session_id.to_string(),
        identity: None,
        display_name: display_name.to_string(),
        created_at: now,
        last_active_at: now,
    }
}
