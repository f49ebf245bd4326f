//! Switchboard error types.
//!
//! Validation errors map onto the wire `room_error` codes; everything else
//! collapses to a generic code so internal details are logged server-side
//! but never exposed to clients.

use signal_protocol::RoomErrorCode;
use thiserror::Error;

use crate::store::StoreError;

/// Service error type.
///
/// Maps to `room_error{code}` values:
/// - `RoomNotFound`, `RoomClosed`: `room_not_found`
/// - `IncorrectPassword`: `incorrect_password`
/// - `NotInRoom`: `NOT_IN_ROOM`
/// - everything else: `join_error`
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// Room does not exist, neither live nor in the durable store.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Supplied password does not match the room's password.
    #[error("Incorrect password for room {0}")]
    IncorrectPassword(String),

    /// A create asked for a room id that is already live.
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    /// The operation requires room membership the caller does not have.
    #[error("Not in room")]
    NotInRoom,

    /// The room's actor went away while the operation was in flight.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// The registry actor is not reachable (shutdown or crashed).
    #[error("Registry unavailable")]
    RegistryUnavailable,

    /// Durable store operation failed. Mostly swallowed at call sites;
    /// surfaces only from paths where the store is the operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SwitchboardError {
    /// The wire `room_error` code for this error.
    #[must_use]
    pub const fn code(&self) -> RoomErrorCode {
        match self {
            Self::RoomNotFound(_) | Self::RoomClosed(_) => RoomErrorCode::RoomNotFound,
            Self::IncorrectPassword(_) => RoomErrorCode::IncorrectPassword,
            Self::NotInRoom => RoomErrorCode::NotInRoom,
            Self::RoomAlreadyExists(_) | Self::RegistryUnavailable | Self::Store(_) => {
                RoomErrorCode::JoinError
            }
        }
    }

    /// Client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::RoomNotFound(room_id) | Self::RoomClosed(room_id) => {
                format!("Room {room_id} not found")
            }
            Self::IncorrectPassword(_) => "Incorrect password".to_string(),
            Self::RoomAlreadyExists(room_id) => format!("Room id {room_id} is already taken"),
            Self::NotInRoom => "You are not in a room".to_string(),
            Self::RegistryUnavailable | Self::Store(_) => {
                "Unable to join right now, please try again".to_string()
            }
        }
    }
}
