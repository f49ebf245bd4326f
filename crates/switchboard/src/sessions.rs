//! Session resolution and caching.
//!
//! A session maps an opaque resumption token to a display identity so a
//! client can reconnect as "the same person" without re-entering anything.
//! Sessions are independent of rooms; the cache additionally remembers the
//! last room a session joined (not persisted) to offer it back on restore.
//!
//! The in-memory map is authoritative while the process lives; every
//! mutation write-through persists best-effort so sessions survive a
//! restart. An unknown resumption token is not an error, it degrades to
//! creating a fresh session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::observability::metrics;
use crate::store::{self, DurableStore, SessionRecord, SharedStore};

/// Display name used when a client never supplies one.
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// A resolved session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque resumption token; the caller's identity when present,
    /// otherwise the connection id that first created the session.
    pub session_id: String,
    /// Stable external identity, when the caller declared one.
    pub identity: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Last room this session joined. Cache-only; a restart forgets it.
    pub current_room_id: Option<String>,
}

impl Session {
    fn from_record(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            identity: record.identity,
            display_name: record.display_name,
            created_at: record.created_at,
            last_active_at: record.last_active_at,
            current_room_id: None,
        }
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }
}

/// Cached session map over the durable store.
///
/// Cheaply cloneable; every gateway connection shares one instance.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    store: SharedStore,
}

impl SessionStore {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    /// Resolve a resumption token to a session, or create a new one.
    ///
    /// Returns the session and whether it was created (`true`) or restored
    /// (`false`). A token that resolves nowhere degrades to create-new. A
    /// new session is keyed by `identity` when present, else by
    /// `connection_id`.
    pub async fn resolve_or_create(
        &self,
        resumption_token: Option<&str>,
        identity: Option<&str>,
        display_name: Option<&str>,
        connection_id: &str,
    ) -> (Session, bool) {
        if let Some(token) = resumption_token {
            if let Some(session) = self.restore(token, display_name).await {
                return (session, false);
            }
            debug!(
                target: "sb.session",
                "Resumption token resolved nowhere, creating new session"
            );
        }

        let session_id = identity.map_or_else(|| connection_id.to_string(), ToString::to_string);
        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            identity: identity.map(ToString::to_string),
            display_name: display_name
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_DISPLAY_NAME)
                .to_string(),
            created_at: now,
            last_active_at: now,
            current_room_id: None,
        };

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), session.clone());
            metrics::set_sessions_active(sessions.len());
        }
        store::persist_session_best_effort(&self.store, session.to_record());

        info!(
            target: "sb.session",
            session_id = %session_id,
            has_identity = session.identity.is_some(),
            "Session created"
        );

        (session, true)
    }

    /// Restore a session by token: cache first, durable store fallback.
    async fn restore(&self, token: &str, display_name: Option<&str>) -> Option<Session> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(token) {
                session.last_active_at = Utc::now();
                apply_name(session, display_name);
                let restored = session.clone();
                drop(sessions);

                store::persist_session_best_effort(&self.store, restored.to_record());
                debug!(
                    target: "sb.session",
                    session_id = %restored.session_id,
                    "Session restored from cache"
                );
                return Some(restored);
            }
        }

        let start = Instant::now();
        let loaded = self.store.load_session(token).await;
        metrics::observe_store_latency("load_session", start.elapsed());

        match loaded {
            Ok(Some(record)) => {
                let mut session = Session::from_record(record);
                session.last_active_at = Utc::now();
                apply_name(&mut session, display_name);

                {
                    let mut sessions = self.sessions.write().await;
                    sessions.insert(session.session_id.clone(), session.clone());
                    metrics::set_sessions_active(sessions.len());
                }
                store::persist_session_best_effort(&self.store, session.to_record());

                info!(
                    target: "sb.session",
                    session_id = %session.session_id,
                    "Session restored from durable store"
                );
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    target: "sb.session",
                    error = %e,
                    "Durable session lookup failed, treating token as unknown"
                );
                metrics::increment_store_failures("load_session");
                None
            }
        }
    }

    /// Extend a session's activity window.
    pub async fn touch(&self, session_id: &str) {
        let record = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            session.last_active_at = Utc::now();
            session.to_record()
        };
        store::persist_session_best_effort(&self.store, record);
    }

    /// Record (or clear) the last room this session joined.
    pub async fn bind_room(&self, session_id: &str, room_id: Option<String>) {
        let record = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            session.current_room_id = room_id;
            session.last_active_at = Utc::now();
            session.to_record()
        };
        store::persist_session_best_effort(&self.store, record);
    }

    /// Remove sessions idle since before `cutoff`. Returns how many were
    /// removed; their durable records are deleted best-effort.
    pub async fn prune_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let pruned: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.last_active_at < cutoff)
                .map(|(session_id, _)| session_id.clone())
                .collect();
            for session_id in &expired {
                sessions.remove(session_id);
            }
            metrics::set_sessions_active(sessions.len());
            expired
        };

        for session_id in &pruned {
            store::delete_session_best_effort(&self.store, session_id.clone());
        }

        if !pruned.is_empty() {
            info!(
                target: "sb.session",
                count = pruned.len(),
                "Pruned idle sessions"
            );
        }
        pruned.len()
    }
}

/// A newly supplied display name wins unless it is blank or the default.
fn apply_name(session: &mut Session, display_name: Option<&str>) {
    if let Some(name) = display_name {
        if !name.is_empty() && name != DEFAULT_DISPLAY_NAME {
            session.display_name = name.to_string();
        }
    }
}
