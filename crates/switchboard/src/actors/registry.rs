//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the top level of the actor hierarchy:
//!
//! - Singleton per process, injected by handle (nothing global)
//! - Owns only the `roomId -> room handle` map and room spawn/reap
//! - Resolves durable-only rooms back into live actors on demand
//! - Owns the parent `CancellationToken` for the rooms
//!
//! The registry never awaits a room's reply inside its own loop: join,
//! verify and state queries are piped through spawned forwarding tasks so a
//! slow room cannot stall room resolution for everyone else. Room exits
//! arrive as [`RegistryNotice`] values on an unbounded channel, drained with
//! priority, so a lookup issued after a completed leave observes the room
//! as absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use signal_protocol::ParticipantSummary;

use super::messages::{
    CreateRoomRequest, JoinRoomRequest, JoinedRoom, RegistryMessage, RegistryNotice,
    RegistryStats, RejoinRoomRequest, RoomSnapshot, RoomState, VerifyOutcome,
};
use super::room::{RoomActor, RoomActorHandle, RoomContext};
use crate::errors::SwitchboardError;
use crate::observability::analytics::{AnalyticsEvent, AnalyticsPublisher};
use crate::observability::metrics;
use crate::store::{self, DurableStore, SharedStore};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Alphabet for generated room codes. Uppercase with the lookalikes
/// (I, L, O, 0, 1) removed so codes survive being read aloud.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Length of generated room codes.
const ROOM_CODE_LENGTH: usize = 6;

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for room resolution. All methods are async
/// and return results via oneshot channels.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a room with the caller as its first participant.
    ///
    /// # Errors
    ///
    /// `RoomAlreadyExists` when the requested id is already live;
    /// `RegistryUnavailable` when the registry actor is gone.
    pub async fn create_room(
        &self,
        request: CreateRoomRequest,
    ) -> Result<JoinedRoom, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateRoom {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RegistryUnavailable)?;

        rx.await.map_err(|_| SwitchboardError::RegistryUnavailable)?
    }

    /// Join a room, resolving it from the durable store if necessary.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` when the room exists nowhere; `IncorrectPassword`
    /// when the room rejects the password; `RegistryUnavailable` when the
    /// registry actor is gone.
    pub async fn join_room(
        &self,
        request: JoinRoomRequest,
    ) -> Result<JoinedRoom, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::JoinRoom {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RegistryUnavailable)?;

        rx.await.map_err(|_| SwitchboardError::RegistryUnavailable)?
    }

    /// Rejoin a room after a disconnect.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` when the room exists nowhere; `RegistryUnavailable`
    /// when the registry actor is gone.
    pub async fn rejoin_room(
        &self,
        request: RejoinRoomRequest,
    ) -> Result<JoinedRoom, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RejoinRoom {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RegistryUnavailable)?;

        rx.await.map_err(|_| SwitchboardError::RegistryUnavailable)?
    }

    /// Look up a room without joining it. `None` when the room exists
    /// nowhere (or the registry is gone).
    pub async fn find_room(&self, room_id: String) -> Option<RoomSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::FindRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok().flatten()
    }

    /// Check room existence and password without joining. A missing room
    /// (or missing registry) reports `exists: false`.
    pub async fn verify_room(&self, room_id: String, password: Option<String>) -> VerifyOutcome {
        let absent = VerifyOutcome {
            exists: false,
            password_ok: false,
        };
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryMessage::VerifyRoom {
                room_id,
                password,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return absent;
        }

        rx.await.unwrap_or(absent)
    }

    /// Close live rooms with no participants that have been idle past the
    /// cutoff. Returns the number of rooms closed.
    ///
    /// # Errors
    ///
    /// `RegistryUnavailable` when the registry actor is gone.
    pub async fn sweep_idle_rooms(
        &self,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<usize, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::SweepIdleRooms {
                idle_cutoff,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RegistryUnavailable)?;

        rx.await.map_err(|_| SwitchboardError::RegistryUnavailable)
    }

    /// Get registry statistics.
    ///
    /// # Errors
    ///
    /// `RegistryUnavailable` when the registry actor is gone.
    pub async fn get_stats(&self) -> Result<RegistryStats, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStats { respond_to: tx })
            .await
            .map_err(|_| SwitchboardError::RegistryUnavailable)?;

        rx.await.map_err(|_| SwitchboardError::RegistryUnavailable)
    }

    /// Cancel the registry (and every room under it).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the registry is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    /// Handle to the room actor.
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    /// Message receiver.
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Sender half of the notice channel, cloned into each room's context.
    notice_sender: mpsc::UnboundedSender<RegistryNotice>,
    /// Upward notices from room actors.
    notices: mpsc::UnboundedReceiver<RegistryNotice>,
    /// Cancellation token; rooms get child tokens.
    cancel_token: CancellationToken,
    /// Live rooms by id.
    rooms: HashMap<String, ManagedRoom>,
    /// Durable store for room resolution and rehydration.
    store: SharedStore,
    /// Analytics boundary.
    analytics: AnalyticsPublisher,
    /// Disconnect grace window, passed to rooms.
    grace_period: Duration,
}

impl RoomRegistryActor {
    /// Spawn the registry actor.
    pub fn spawn(
        store: SharedStore,
        analytics: AnalyticsPublisher,
        grace_period: Duration,
        cancel_token: CancellationToken,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let (notice_sender, notices) = mpsc::unbounded_channel();

        let actor = Self {
            receiver,
            notice_sender,
            notices,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            store,
            analytics,
            grace_period,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomRegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    ///
    /// Notices are drained with priority over new requests so that a room
    /// exit queued before a lookup is applied before the lookup runs.
    #[instrument(skip_all, name = "sb.actor.registry")]
    async fn run(mut self) {
        info!(target: "sb.actor.registry", "RoomRegistryActor started");

        loop {
            self.reap_finished_rooms().await;

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sb.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                notice = self.notices.recv() => {
                    // The registry holds a sender clone, so the notice
                    // channel outlives every room.
                    if let Some(notice) = notice {
                        self.handle_notice(notice);
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "sb.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sb.actor.registry",
            rooms_remaining = self.rooms.len(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                request,
                respond_to,
            } => {
                self.create_room(request, respond_to);
            }

            RegistryMessage::JoinRoom {
                request,
                respond_to,
            } => {
                match self.resolve_room(&request.room_id).await {
                    Some(room) => Self::pipe_join(room, request, respond_to),
                    None => {
                        let _ = respond_to
                            .send(Err(SwitchboardError::RoomNotFound(request.room_id)));
                    }
                }
            }

            RegistryMessage::RejoinRoom {
                request,
                respond_to,
            } => {
                match self.resolve_room(&request.room_id).await {
                    Some(room) => Self::pipe_rejoin(room, request, respond_to),
                    None => {
                        let _ = respond_to
                            .send(Err(SwitchboardError::RoomNotFound(request.room_id)));
                    }
                }
            }

            RegistryMessage::FindRoom {
                room_id,
                respond_to,
            } => {
                match self.resolve_room(&room_id).await {
                    Some(room) => {
                        tokio::spawn(async move {
                            let snapshot = room.get_state().await.ok().map(|s| snapshot_of(&s));
                            let _ = respond_to.send(snapshot);
                        });
                    }
                    None => {
                        let _ = respond_to.send(None);
                    }
                }
            }

            RegistryMessage::VerifyRoom {
                room_id,
                password,
                respond_to,
            } => {
                match self.resolve_room(&room_id).await {
                    Some(room) => {
                        tokio::spawn(async move {
                            let outcome = room.verify(password).await.unwrap_or(VerifyOutcome {
                                exists: false,
                                password_ok: false,
                            });
                            let _ = respond_to.send(outcome);
                        });
                    }
                    None => {
                        let _ = respond_to.send(VerifyOutcome {
                            exists: false,
                            password_ok: false,
                        });
                    }
                }
            }

            RegistryMessage::SweepIdleRooms {
                idle_cutoff,
                respond_to,
            } => {
                self.sweep_idle_rooms(idle_cutoff, respond_to);
            }

            RegistryMessage::GetStats { respond_to } => {
                self.get_stats(respond_to);
            }
        }
    }

    /// Handle an upward notice from a room actor.
    fn handle_notice(&mut self, notice: RegistryNotice) {
        match notice {
            RegistryNotice::RoomEmptied { room_id } => {
                let Some(managed) = self.rooms.remove(&room_id) else {
                    // Already reaped.
                    return;
                };
                metrics::set_rooms_active(self.rooms.len());

                debug!(
                    target: "sb.actor.registry",
                    room_id = %room_id,
                    total_rooms = self.rooms.len(),
                    "Emptied room removed from registry"
                );

                // The actor is already exiting; collect the task off the
                // message loop.
                tokio::spawn(async move {
                    if tokio::time::timeout(Duration::from_secs(5), managed.task_handle)
                        .await
                        .is_err()
                    {
                        warn!(
                            target: "sb.actor.registry",
                            room_id = %room_id,
                            "Emptied room actor did not exit in time"
                        );
                    }
                });
            }
        }
    }

    /// Create a new room and pipe the creator's join through it.
    fn create_room(
        &mut self,
        request: CreateRoomRequest,
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    ) {
        let room_id = match &request.requested_id {
            Some(requested) => {
                // Only a live duplicate is a conflict; a durable-only record
                // under this id is superseded by the new room's first write.
                if self.rooms.contains_key(requested) {
                    let _ = respond_to
                        .send(Err(SwitchboardError::RoomAlreadyExists(requested.clone())));
                    return;
                }
                requested.clone()
            }
            None => self.generate_unused_code(),
        };

        let room_token = self.cancel_token.child_token();
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            request.creator_identity.clone(),
            request.password.clone(),
            room_token,
            self.room_context(),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        metrics::set_rooms_active(self.rooms.len());
        metrics::increment_rooms_created();
        self.analytics.publish(AnalyticsEvent::RoomCreated {
            room_id: room_id.clone(),
        });

        info!(
            target: "sb.actor.registry",
            room_id = %room_id,
            is_password_protected = request.password.is_some(),
            total_rooms = self.rooms.len(),
            "Room created"
        );

        // The creator enters through the normal join path and gets the
        // creator role as the room's first participant.
        Self::pipe_join(
            handle,
            JoinRoomRequest {
                room_id,
                connection_id: request.connection_id,
                display_name: request.display_name,
                password: request.password,
                sender: request.sender,
            },
            respond_to,
        );
    }

    /// Forward a join into a room actor without blocking the registry.
    fn pipe_join(
        room: RoomActorHandle,
        request: JoinRoomRequest,
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    ) {
        tokio::spawn(async move {
            let result = room
                .join(
                    request.connection_id,
                    request.display_name,
                    request.password,
                    request.sender,
                )
                .await;
            let _ = respond_to.send(result.map(|snapshot| JoinedRoom { snapshot, room }));
        });
    }

    /// Forward a rejoin into a room actor without blocking the registry.
    fn pipe_rejoin(
        room: RoomActorHandle,
        request: RejoinRoomRequest,
        respond_to: oneshot::Sender<Result<JoinedRoom, SwitchboardError>>,
    ) {
        tokio::spawn(async move {
            let result = room
                .rejoin(
                    request.connection_id,
                    request.display_name,
                    request.previous_connection_id,
                    request.sender,
                )
                .await;
            let _ = respond_to.send(result.map(|snapshot| JoinedRoom { snapshot, room }));
        });
    }

    /// Resolve a room id to a live handle, falling back to the durable
    /// store.
    ///
    /// A durable-only record is rehydrated into a live actor with every
    /// participant inactive and on a fresh grace window. A durable record
    /// with zero participants is an expired orphan: deleted best-effort and
    /// treated as absent. Store failures degrade to absent; the live cache
    /// stays authoritative.
    async fn resolve_room(&mut self, room_id: &str) -> Option<RoomActorHandle> {
        if let Some(managed) = self.rooms.get(room_id) {
            return Some(managed.handle.clone());
        }

        let start = std::time::Instant::now();
        let loaded = self.store.load_room(room_id).await;
        metrics::observe_store_latency("load_room", start.elapsed());

        let record = match loaded {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    target: "sb.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    "Durable room lookup failed, treating as absent"
                );
                metrics::increment_store_failures("load_room");
                return None;
            }
        };

        if record.participants.is_empty() {
            debug!(
                target: "sb.actor.registry",
                room_id = %room_id,
                "Durable record has no participants, deleting expired orphan"
            );
            store::delete_room_best_effort(&self.store, room_id.to_string());
            return None;
        }

        info!(
            target: "sb.actor.registry",
            room_id = %room_id,
            participants = record.participants.len(),
            "Rehydrating room from durable store"
        );

        let room_token = self.cancel_token.child_token();
        let (handle, task_handle) =
            RoomActor::spawn_rehydrated(record, room_token, self.room_context());

        self.rooms.insert(
            room_id.to_string(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        metrics::set_rooms_active(self.rooms.len());

        Some(handle)
    }

    /// Close idle rooms with no participants. The querying runs in a
    /// spawned task; closed rooms exit on their own and are reaped from
    /// the map afterwards.
    fn sweep_idle_rooms(
        &self,
        idle_cutoff: DateTime<Utc>,
        respond_to: oneshot::Sender<usize>,
    ) {
        let rooms: Vec<(String, RoomActorHandle)> = self
            .rooms
            .iter()
            .map(|(id, managed)| (id.clone(), managed.handle.clone()))
            .collect();
        let analytics = self.analytics.clone();

        tokio::spawn(async move {
            let mut closed = 0usize;
            for (room_id, handle) in rooms {
                let Ok(state) = handle.get_state().await else {
                    // Already exiting; the reap pass picks it up.
                    continue;
                };
                if state.participants.is_empty() && state.last_active_at < idle_cutoff {
                    info!(
                        target: "sb.actor.registry",
                        room_id = %room_id,
                        last_active_at = %state.last_active_at,
                        "Closing idle empty room"
                    );
                    handle.cancel();
                    metrics::increment_rooms_closed("idle");
                    analytics.publish(AnalyticsEvent::RoomClosed {
                        room_id,
                        reason: "idle",
                    });
                    closed += 1;
                }
            }
            let _ = respond_to.send(closed);
        });
    }

    /// Gather registry statistics in a spawned task.
    fn get_stats(&self, respond_to: oneshot::Sender<RegistryStats>) {
        let room_count = self.rooms.len();
        let handles: Vec<RoomActorHandle> =
            self.rooms.values().map(|m| m.handle.clone()).collect();

        tokio::spawn(async move {
            let mut participant_count = 0usize;
            for handle in handles {
                if let Ok(state) = handle.get_state().await {
                    participant_count += state.participants.len();
                }
            }
            let _ = respond_to.send(RegistryStats {
                room_count,
                participant_count,
            });
        });
    }

    /// Remove rooms whose actor task has terminated.
    ///
    /// Emptied rooms normally leave via [`RegistryNotice::RoomEmptied`];
    /// this pass catches panics and sweep-cancelled rooms.
    async fn reap_finished_rooms(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sb.actor.registry",
                        room_id = %room_id,
                        "Room actor exited, removed from registry"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sb.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        metrics::increment_actor_panics("room");
                    }
                }
            }
        }

        metrics::set_rooms_active(self.rooms.len());
    }

    /// Perform graceful shutdown: cancel every room and wait for each to
    /// land its final durable record, bounded per room.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sb.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        for (room_id, managed) in &self.rooms {
            debug!(
                target: "sb.actor.registry",
                room_id = %room_id,
                "Cancelling room actor"
            );
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sb.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sb.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sb.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }

        metrics::set_rooms_active(0);

        info!(target: "sb.actor.registry", "Graceful shutdown complete");
    }

    /// Plumbing bundle for a new room actor.
    fn room_context(&self) -> RoomContext {
        RoomContext {
            notices: self.notice_sender.clone(),
            store: Arc::clone(&self.store),
            analytics: self.analytics.clone(),
            grace_period: self.grace_period,
        }
    }

    /// Generate a room code not currently live.
    ///
    /// The code space is 31^6, so a collision is a retry, not an error.
    fn generate_unused_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = generate_room_code(&mut rng);
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }
}

/// Generate one room code from the unambiguous alphabet.
fn generate_room_code<R: Rng>(rng: &mut R) -> String {
    (0..ROOM_CODE_LENGTH)
        .map(|_| {
            ROOM_CODE_ALPHABET
                .choose(rng)
                .copied()
                .map_or('A', char::from)
        })
        .collect()
}

/// Client-facing snapshot built from full room state.
fn snapshot_of(state: &RoomState) -> RoomSnapshot {
    RoomSnapshot {
        room_id: state.room_id.clone(),
        participants: state
            .participants
            .iter()
            .map(|p| ParticipantSummary {
                user_id: p.participant_id.clone(),
                display_name: p.display_name.clone(),
                inactive: p.status == super::messages::ParticipantStatus::Inactive,
            })
            .collect(),
        is_password_protected: state.is_password_protected,
    }
}
