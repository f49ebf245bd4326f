//! Durable room/session store.
//!
//! Rooms and sessions live in memory while active; the durable store is a
//! write-behind copy used to survive restarts and to rehydrate rooms that
//! have fallen out of the live cache. Writes are best-effort: failures are
//! logged and counted, never surfaced to clients.
//!
//! # Key Patterns
//!
//! - `room:{roomId}` - Room record (JSON)
//! - `session:{sessionId}` - Session record (JSON)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

use crate::observability::metrics;

pub mod redis;

pub use redis::RedisStore;

/// Participant role, fixed at creation or merge time and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Created the room.
    Creator,
    /// Joined an existing room.
    Member,
}

/// Persisted participant entry inside a room record.
///
/// `previousId` holds the most recent prior connection id after a rejoin
/// merge; the full in-memory chain is flattened to its head on persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub user_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub role: ParticipantRole,
    #[serde(default)]
    pub inactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
}

/// Persisted room record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    pub creator_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
}

/// Persisted session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Durable store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store interface.
///
/// Implemented by [`RedisStore`] in production and by the in-memory store
/// in `sb-test-utils` for tests.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn save_room(&self, record: &RoomRecord) -> Result<(), StoreError>;
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;
    async fn delete_room(&self, room_id: &str) -> Result<(), StoreError>;

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Shared handle to the durable store.
pub type SharedStore = Arc<dyn DurableStore>;

/// Persist a room record in the background.
///
/// Failures are logged and counted, never returned. Callers must not
/// depend on the write having landed.
pub fn persist_room_best_effort(store: &SharedStore, record: RoomRecord) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        let start = Instant::now();
        let result = store.save_room(&record).await;
        metrics::observe_store_latency("save_room", start.elapsed());
        if let Err(e) = result {
            warn!(
                target: "sb.store",
                error = %e,
                room_id = %record.room_id,
                "Failed to persist room"
            );
            metrics::increment_store_failures("save_room");
        }
    });
}

/// Delete a room record in the background, best-effort.
pub fn delete_room_best_effort(store: &SharedStore, room_id: String) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        let start = Instant::now();
        let result = store.delete_room(&room_id).await;
        metrics::observe_store_latency("delete_room", start.elapsed());
        if let Err(e) = result {
            warn!(
                target: "sb.store",
                error = %e,
                room_id = %room_id,
                "Failed to delete room record"
            );
            metrics::increment_store_failures("delete_room");
        }
    });
}

/// Persist a session record in the background, best-effort.
pub fn persist_session_best_effort(store: &SharedStore, record: SessionRecord) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        let start = Instant::now();
        let result = store.save_session(&record).await;
        metrics::observe_store_latency("save_session", start.elapsed());
        if let Err(e) = result {
            warn!(
                target: "sb.store",
                error = %e,
                session_id = %record.session_id,
                "Failed to persist session"
            );
            metrics::increment_store_failures("save_session");
        }
    });
}

/// Delete a session record in the background, best-effort.
pub fn delete_session_best_effort(store: &SharedStore, session_id: String) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        let start = Instant::now();
        let result = store.delete_session(&session_id).await;
        metrics::observe_store_latency("delete_session", start.elapsed());
        if let Err(e) = result {
            warn!(
                target: "sb.store",
                error = %e,
                session_id = %session_id,
                "Failed to delete session record"
            );
            metrics::increment_store_failures("delete_session");
        }
    });
}
