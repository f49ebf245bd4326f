//! In-memory durable store for tests.
//!
//! Implements the service's `DurableStore` trait over plain hash maps so
//! room, registry, and session tests run without Redis. Failure injection
//! turns reads or writes into errors to exercise the degraded paths: reads
//! that fall back to treating state as absent, and best-effort writes that
//! log and move on.
//!
//! # Example
//!
//! ```rust,ignore
//! use sb_test_utils::MemoryStore;
//!
//! let store = MemoryStore::new();
//! store.set_fail_reads(true);
//! // load_room / load_session now return errors
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use switchboard::store::{DurableStore, RoomRecord, SessionRecord, StoreError};

/// In-memory `DurableStore` with optional failure injection.
///
/// Cheaply cloneable; clones share the same underlying state, mirroring how
/// production code shares one store behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    rooms: HashMap<String, RoomRecord>,
    sessions: HashMap<String, SessionRecord>,
    fail_reads: bool,
    fail_writes: bool,
}

fn injected_failure(operation: &str) -> StoreError {
    StoreError::Redis(::redis::RedisError::from((
        ::redis::ErrorKind::IoError,
        "injected store failure",
        operation.to_string(),
    )))
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room record, as if a previous process had persisted it.
    #[must_use]
    pub fn with_room(self, record: RoomRecord) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.rooms.insert(record.room_id.clone(), record);
        }
        self
    }

    /// Seed a session record.
    #[must_use]
    pub fn with_session(self, record: SessionRecord) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.insert(record.session_id.clone(), record);
        }
        self
    }

    /// Make every subsequent read return an error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().unwrap().fail_reads = fail;
    }

    /// Make every subsequent write and delete return an error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    /// Number of room records currently stored.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.lock().unwrap().rooms.len()
    }

    /// Number of session records currently stored.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn save_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(injected_failure("save_room"));
        }
        inner.rooms.insert(record.room_id.clone(), record.clone());
        Ok(())
    }

    async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_reads {
            return Err(injected_failure("load_room"));
        }
        Ok(inner.rooms.get(room_id).cloned())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(injected_failure("delete_room"));
        }
        inner.rooms.remove(room_id);
        Ok(())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(injected_failure("save_session"));
        }
        inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_reads {
            return Err(injected_failure("load_session"));
        }
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(injected_failure("delete_session"));
        }
        inner.sessions.remove(session_id);
        Ok(())
    }
}
