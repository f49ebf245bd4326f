//! `RoomActor` - per-room actor that owns all room state.
//!
//! Each `RoomActor`:
//! - Owns the participant map for one room (the only writer)
//! - Serializes every room mutation through its mailbox
//! - Runs the disconnect grace timers for its participants
//! - Relays signaling payloads between participant connections
//! - Write-through persists its record to the durable store, best-effort
//!
//! # Participant Disconnect Handling
//!
//! When a connection drops:
//! 1. The participant is marked inactive (still visible to peers, flagged)
//! 2. A 30-second grace timer starts, cancellable by a recognized rejoin
//! 3. If the timer fires first: the record is deleted and `user_left` goes out
//!
//! A room whose last record is deleted tells the registry on the notice
//! channel and exits; the registry owns the map entry, the room owns
//! everything else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use signal_protocol::{ParticipantSummary, ServerEvent};

use super::messages::{
    ClientSender, ParticipantDetail, ParticipantStatus, RegistryNotice, RoomMessage, RoomSnapshot,
    RoomState, SignalKind, VerifyOutcome,
};
use crate::errors::SwitchboardError;
use crate::observability::analytics::{AnalyticsEvent, AnalyticsPublisher};
use crate::observability::metrics;
use crate::store::{
    self, DurableStore, ParticipantRecord, ParticipantRole, RoomRecord, SharedStore,
};

/// Mailbox buffer per room.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// Shared plumbing handed to every room actor the registry spawns.
#[derive(Clone)]
pub struct RoomContext {
    /// Upward notice channel to the registry.
    pub notices: mpsc::UnboundedSender<RegistryNotice>,
    /// Durable store for write-through persistence.
    pub store: SharedStore,
    /// Analytics boundary.
    pub analytics: AnalyticsPublisher,
    /// Disconnect grace window.
    pub grace_period: Duration,
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    /// Get the room id.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Join the room. Idempotent for a participant id already present.
    ///
    /// # Errors
    ///
    /// `IncorrectPassword` when the room is protected and the supplied
    /// password does not match; `RoomClosed` when the room actor is gone.
    pub async fn join(
        &self,
        participant_id: String,
        display_name: String,
        password: Option<String>,
        sender: ClientSender,
    ) -> Result<RoomSnapshot, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                participant_id,
                display_name,
                password,
                sender,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?
    }

    /// Rejoin the room under a new connection id.
    ///
    /// # Errors
    ///
    /// `RoomClosed` when the room actor is gone.
    pub async fn rejoin(
        &self,
        participant_id: String,
        display_name: Option<String>,
        previous_connection_id: Option<String>,
        sender: ClientSender,
    ) -> Result<RoomSnapshot, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Rejoin {
                participant_id,
                display_name,
                previous_connection_id,
                sender,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?
    }

    /// Check the room's password without joining.
    ///
    /// # Errors
    ///
    /// `RoomClosed` when the room actor is gone.
    pub async fn verify(&self, password: Option<String>) -> Result<VerifyOutcome, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Verify {
                password,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))
    }

    /// Signal negotiation readiness. Fire-and-forget.
    pub async fn ready(&self, participant_id: String, display_name: String) {
        let _ = self
            .sender
            .send(RoomMessage::Ready {
                participant_id,
                display_name,
            })
            .await;
    }

    /// Leave the room explicitly (immediate removal).
    ///
    /// # Errors
    ///
    /// `NotInRoom` when the participant has no record here; `RoomClosed`
    /// when the room actor is gone.
    pub async fn leave(&self, participant_id: String) -> Result<(), SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                participant_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?
    }

    /// Report a dropped transport connection. Fire-and-forget.
    pub async fn disconnected(&self, participant_id: String) {
        let _ = self
            .sender
            .send(RoomMessage::Disconnected { participant_id })
            .await;
    }

    /// Relay a signaling payload toward `target`. Fire-and-forget.
    pub async fn relay(
        &self,
        from: String,
        kind: SignalKind,
        target: String,
        payload: serde_json::Value,
        display_name: Option<String>,
    ) {
        let _ = self
            .sender
            .send(RoomMessage::Relay {
                from,
                kind,
                target,
                payload,
                display_name,
            })
            .await;
    }

    /// Get current room state.
    ///
    /// # Errors
    ///
    /// `RoomClosed` when the room actor is gone.
    pub async fn get_state(&self) -> Result<RoomState, SwitchboardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SwitchboardError::RoomClosed(self.room_id.clone()))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Participant state within a room.
///
/// Keyed by the connection id that currently represents the membership;
/// `previous_ids` accumulates superseded connection ids across rejoin
/// merges, most recent first.
#[derive(Debug)]
struct Participant {
    participant_id: String,
    display_name: String,
    role: ParticipantRole,
    status: ParticipantStatus,
    /// Outbound channel to the current connection; `None` while inactive.
    sender: Option<ClientSender>,
    previous_ids: Vec<String>,
    joined_at: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
}

impl Participant {
    fn to_summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            user_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            inactive: self.status == ParticipantStatus::Inactive,
        }
    }

    fn to_detail(&self) -> ParticipantDetail {
        ParticipantDetail {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            status: self.status,
            previous_ids: self.previous_ids.clone(),
            disconnected_at: self.disconnected_at,
        }
    }

    fn to_record(&self) -> ParticipantRecord {
        ParticipantRecord {
            user_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            joined_at: self.joined_at,
            role: self.role,
            inactive: self.status == ParticipantStatus::Inactive,
            disconnected_at: self.disconnected_at,
            previous_id: self.previous_ids.first().cloned(),
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Clone of the mailbox sender, handed to grace timer tasks so expiry
    /// re-enters the mailbox and runs under the room's serialization.
    self_sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    creator_identity: String,
    password: Option<String>,
    participants: HashMap<String, Participant>,
    /// Cancel handles for outstanding grace timers, by participant id.
    grace_timers: HashMap<String, CancellationToken>,
    notices: mpsc::UnboundedSender<RegistryNotice>,
    store: SharedStore,
    analytics: AnalyticsPublisher,
    grace_period: Duration,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    /// True once a creator role has been handed out; the first participant
    /// of a fresh room gets it, everyone after is a member.
    creator_assigned: bool,
    /// Set when the last record is deleted; the run loop closes the room.
    emptied: bool,
}

impl RoomActor {
    /// Spawn a fresh room.
    ///
    /// The room starts with no participants; the registry joins the creator
    /// through the normal join path, which hands out the creator role.
    pub fn spawn(
        room_id: String,
        creator_identity: String,
        password: Option<String>,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let now = Utc::now();
        Self::spawn_inner(
            room_id,
            creator_identity,
            password,
            HashMap::new(),
            now,
            now,
            false,
            cancel_token,
            context,
        )
    }

    /// Spawn a room rehydrated from a durable record.
    ///
    /// Every restored participant comes back inactive with a fresh grace
    /// window; whoever does not rejoin in time is removed as usual.
    pub fn spawn_rehydrated(
        record: RoomRecord,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let now = Utc::now();
        let participants: HashMap<String, Participant> = record
            .participants
            .into_iter()
            .map(|p| {
                (
                    p.user_id.clone(),
                    Participant {
                        participant_id: p.user_id,
                        display_name: p.display_name,
                        role: p.role,
                        status: ParticipantStatus::Inactive,
                        sender: None,
                        previous_ids: p.previous_id.into_iter().collect(),
                        joined_at: p.joined_at,
                        disconnected_at: Some(now),
                    },
                )
            })
            .collect();

        // Restored records enter the participant gauge here; their eventual
        // leave or grace removal decrements it like any other record.
        metrics::add_participants_active(participants.len());

        Self::spawn_inner(
            record.room_id,
            record.creator_identity,
            record.password,
            participants,
            record.created_at,
            now,
            true,
            cancel_token,
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_inner(
        room_id: String,
        creator_identity: String,
        password: Option<String>,
        participants: HashMap<String, Participant>,
        created_at: DateTime<Utc>,
        last_active_at: DateTime<Utc>,
        creator_assigned: bool,
        cancel_token: CancellationToken,
        context: RoomContext,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            creator_identity,
            password,
            participants,
            grace_timers: HashMap::new(),
            notices: context.notices,
            store: context.store,
            analytics: context.analytics,
            grace_period: context.grace_period,
            created_at,
            last_active_at,
            creator_assigned,
            emptied: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sb.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            "RoomActor started"
        );

        // Restored participants are inactive; each gets one grace window
        // to rejoin before removal.
        let restored: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Inactive)
            .map(|p| p.participant_id.clone())
            .collect();
        for participant_id in restored {
            self.schedule_grace_timer(&participant_id);
        }

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message);
                            if self.emptied {
                                self.close_emptied();
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sb.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                participant_id,
                display_name,
                password,
                sender,
                respond_to,
            } => {
                let result = self.handle_join(participant_id, display_name, password, sender);
                let _ = respond_to.send(result);
            }

            RoomMessage::Rejoin {
                participant_id,
                display_name,
                previous_connection_id,
                sender,
                respond_to,
            } => {
                let result =
                    self.handle_rejoin(participant_id, display_name, previous_connection_id, sender);
                let _ = respond_to.send(result);
            }

            RoomMessage::Verify {
                password,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_verify(password.as_deref()));
            }

            RoomMessage::Ready {
                participant_id,
                display_name,
            } => {
                self.handle_ready(&participant_id, &display_name);
            }

            RoomMessage::Leave {
                participant_id,
                respond_to,
            } => {
                let result = self.handle_leave(&participant_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::Disconnected { participant_id } => {
                self.handle_disconnected(&participant_id);
            }

            RoomMessage::Relay {
                from,
                kind,
                target,
                payload,
                display_name,
            } => {
                self.handle_relay(&from, kind, &target, payload, display_name);
            }

            RoomMessage::GraceExpired { participant_id } => {
                self.handle_grace_expired(&participant_id);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    /// Handle a participant joining.
    ///
    /// An id already present is refreshed in place (idempotent upsert); a
    /// new id is appended active. The first participant of a fresh room
    /// becomes the creator.
    #[instrument(skip_all, fields(room_id = %self.room_id))]
    fn handle_join(
        &mut self,
        participant_id: String,
        display_name: String,
        password: Option<String>,
        sender: ClientSender,
    ) -> Result<RoomSnapshot, SwitchboardError> {
        if let Some(expected) = &self.password {
            if password.as_deref() != Some(expected.as_str()) {
                debug!(target: "sb.actor.room", "Join rejected, incorrect password");
                return Err(SwitchboardError::IncorrectPassword(self.room_id.clone()));
            }
        }

        let kind = if self.creator_assigned {
            "joined"
        } else {
            "created"
        };

        if self.participants.contains_key(&participant_id) {
            let mut name_update = None;
            if let Some(existing) = self.participants.get_mut(&participant_id) {
                if !display_name.is_empty() && existing.display_name != display_name {
                    existing.display_name = display_name.clone();
                    name_update = Some(ServerEvent::UserUpdated {
                        user_id: participant_id.clone(),
                        display_name: display_name.clone(),
                    });
                }
                existing.sender = Some(sender);
                existing.status = ParticipantStatus::Active;
                existing.disconnected_at = None;
            }
            self.cancel_grace_timer(&participant_id);
            if let Some(event) = name_update {
                self.broadcast_except(&participant_id, &event);
            }
            debug!(
                target: "sb.actor.room",
                participant_id = %participant_id,
                "Existing participant refreshed in place"
            );
        } else {
            let role = if self.creator_assigned {
                ParticipantRole::Member
            } else {
                self.creator_assigned = true;
                ParticipantRole::Creator
            };

            self.participants.insert(
                participant_id.clone(),
                Participant {
                    participant_id: participant_id.clone(),
                    display_name: display_name.clone(),
                    role,
                    status: ParticipantStatus::Active,
                    sender: Some(sender),
                    previous_ids: Vec::new(),
                    joined_at: Utc::now(),
                    disconnected_at: None,
                },
            );
            metrics::increment_participants_active();

            self.broadcast_except(
                &participant_id,
                &ServerEvent::UserJoined {
                    user_id: participant_id.clone(),
                    display_name,
                },
            );
        }

        self.last_active_at = Utc::now();
        self.persist();
        metrics::increment_joins(kind);
        self.analytics.publish(AnalyticsEvent::ParticipantJoined {
            room_id: self.room_id.clone(),
            user_id: participant_id.clone(),
            kind,
        });

        info!(
            target: "sb.actor.room",
            total_participants = self.participants.len(),
            "Participant joined"
        );

        Ok(self.snapshot_for(&participant_id))
    }

    /// Handle a rejoin under a new connection id.
    ///
    /// A recognized participant is merged onto the new id; an unrecognized
    /// one falls back to a fresh join with no password check (the room was
    /// already entered once on this client's say-so).
    #[instrument(skip_all, fields(room_id = %self.room_id))]
    fn handle_rejoin(
        &mut self,
        participant_id: String,
        display_name: Option<String>,
        previous_connection_id: Option<String>,
        sender: ClientSender,
    ) -> Result<RoomSnapshot, SwitchboardError> {
        let matched =
            self.recognize_rejoin(previous_connection_id.as_deref(), display_name.as_deref());

        if let Some(old_id) = matched {
            let merged_name = self.merge_participant(&old_id, &participant_id, display_name, sender);

            self.broadcast_except(
                &participant_id,
                &ServerEvent::UserRejoined {
                    user_id: participant_id.clone(),
                    display_name: merged_name,
                },
            );

            self.last_active_at = Utc::now();
            self.persist();
            metrics::increment_joins("rejoined");
            self.analytics.publish(AnalyticsEvent::ParticipantJoined {
                room_id: self.room_id.clone(),
                user_id: participant_id.clone(),
                kind: "rejoined",
            });

            info!(
                target: "sb.actor.room",
                previous_id = %old_id,
                total_participants = self.participants.len(),
                "Participant rejoined"
            );

            return Ok(self.snapshot_for(&participant_id));
        }

        // Nothing recognizable: fall back to a fresh join. The durable
        // record is consulted off the hot path purely to tag the log line
        // when it proves prior membership.
        self.log_returning_check(previous_connection_id);

        let name = display_name.unwrap_or_default();
        debug!(
            target: "sb.actor.room",
            "Rejoin matched no inactive record, joining fresh"
        );

        self.participants.insert(
            participant_id.clone(),
            Participant {
                participant_id: participant_id.clone(),
                display_name: name.clone(),
                role: ParticipantRole::Member,
                status: ParticipantStatus::Active,
                sender: Some(sender),
                previous_ids: Vec::new(),
                joined_at: Utc::now(),
                disconnected_at: None,
            },
        );
        metrics::increment_participants_active();

        self.broadcast_except(
            &participant_id,
            &ServerEvent::UserJoined {
                user_id: participant_id.clone(),
                display_name: name,
            },
        );

        self.last_active_at = Utc::now();
        self.persist();
        metrics::increment_joins("joined");
        self.analytics.publish(AnalyticsEvent::ParticipantJoined {
            room_id: self.room_id.clone(),
            user_id: participant_id.clone(),
            kind: "joined",
        });

        Ok(self.snapshot_for(&participant_id))
    }

    /// Find which existing record a rejoining connection corresponds to.
    ///
    /// Priority order, first match wins:
    /// (a) an inactive record whose id equals the supplied previous
    /// connection id; (b) an inactive record whose prior-id chain contains
    /// it; (c) the inactive record sharing the display name, if and only if
    /// exactly one exists. (c) is a deliberately loose heuristic: two
    /// inactive "Guest" entries are ambiguous and no merge happens.
    fn recognize_rejoin(
        &self,
        previous_connection_id: Option<&str>,
        display_name: Option<&str>,
    ) -> Option<String> {
        if let Some(previous_id) = previous_connection_id {
            if let Some(p) = self.participants.get(previous_id) {
                if p.status == ParticipantStatus::Inactive {
                    return Some(previous_id.to_string());
                }
                // An active record here means a disconnect was never
                // observed; the newer connection wins and the stale record
                // is merged out.
                warn!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    "Rejoin names an active record, superseding stale connection"
                );
                return Some(previous_id.to_string());
            }

            if let Some(p) = self.participants.values().find(|p| {
                p.status == ParticipantStatus::Inactive
                    && p.previous_ids.iter().any(|id| id == previous_id)
            }) {
                return Some(p.participant_id.clone());
            }
        }

        if let Some(name) = display_name {
            if !name.is_empty() {
                let mut same_name = self.participants.values().filter(|p| {
                    p.status == ParticipantStatus::Inactive && p.display_name == name
                });
                if let (Some(only), None) = (same_name.next(), same_name.next()) {
                    return Some(only.participant_id.clone());
                }
            }
        }

        None
    }

    /// Merge a matched record onto a new connection id.
    ///
    /// Deletes the matched record, rewrites it active under the new id with
    /// the old id prepended to the prior-id chain, and prunes any other
    /// inactive records sharing the merged display name as stale
    /// duplicates. Returns the merged display name.
    fn merge_participant(
        &mut self,
        old_id: &str,
        new_id: &str,
        display_name: Option<String>,
        sender: ClientSender,
    ) -> String {
        self.cancel_grace_timer(old_id);

        let Some(old) = self.participants.remove(old_id) else {
            // recognize_rejoin only returns ids present in the map
            warn!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                "Merge target vanished, treating rejoin as fresh join"
            );
            return display_name.unwrap_or_default();
        };

        let merged_name = display_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| old.display_name.clone());

        let mut previous_ids = Vec::with_capacity(old.previous_ids.len() + 1);
        previous_ids.push(old.participant_id.clone());
        previous_ids.extend(old.previous_ids);

        self.participants.insert(
            new_id.to_string(),
            Participant {
                participant_id: new_id.to_string(),
                display_name: merged_name.clone(),
                role: old.role,
                status: ParticipantStatus::Active,
                sender: Some(sender),
                previous_ids,
                joined_at: old.joined_at,
                disconnected_at: None,
            },
        );

        // Inactive records left behind under the same display name are
        // missed transitions from older connections of this participant.
        let stale: Vec<String> = self
            .participants
            .values()
            .filter(|p| {
                p.participant_id != new_id
                    && p.status == ParticipantStatus::Inactive
                    && p.display_name == merged_name
            })
            .map(|p| p.participant_id.clone())
            .collect();

        for stale_id in stale {
            warn!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                stale_id = %stale_id,
                "Pruning stale duplicate left behind by a missed disconnect"
            );
            self.cancel_grace_timer(&stale_id);
            if let Some(removed) = self.participants.remove(&stale_id) {
                metrics::decrement_participants_active();
                self.broadcast_except(
                    &stale_id,
                    &ServerEvent::UserLeft {
                        user_id: stale_id.clone(),
                        display_name: removed.display_name,
                    },
                );
            }
        }

        merged_name
    }

    /// Background check: did the durable record know this participant?
    fn log_returning_check(&self, previous_connection_id: Option<String>) {
        let Some(previous_id) = previous_connection_id else {
            return;
        };
        let store = Arc::clone(&self.store);
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            match store.load_room(&room_id).await {
                Ok(Some(record)) => {
                    let returning = record.participants.iter().any(|p| {
                        p.user_id == previous_id
                            || p.previous_id.as_deref() == Some(previous_id.as_str())
                    });
                    if returning {
                        info!(
                            target: "sb.actor.room",
                            room_id = %room_id,
                            "Unrecognized rejoin was a returning participant, joined fresh"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        target: "sb.actor.room",
                        room_id = %room_id,
                        error = %e,
                        "Returning-participant check failed"
                    );
                }
            }
        });
    }

    /// Verbatim password comparison; a room without a password accepts
    /// anything. Mutates nothing, not even the activity stamp.
    fn handle_verify(&self, password: Option<&str>) -> VerifyOutcome {
        let password_ok = match &self.password {
            Some(expected) => password == Some(expected.as_str()),
            None => true,
        };
        VerifyOutcome {
            exists: true,
            password_ok,
        }
    }

    /// Handle a readiness signal: refresh the display name if it really
    /// changed, then tell every other active participant to open
    /// negotiation toward the ready one.
    fn handle_ready(&mut self, participant_id: &str, display_name: &str) {
        if !self.participants.contains_key(participant_id) {
            debug!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                "Ready from unknown participant, ignored"
            );
            return;
        }

        let mut name_update = None;
        if let Some(p) = self.participants.get_mut(participant_id) {
            if !display_name.is_empty() && p.display_name != display_name {
                p.display_name = display_name.to_string();
                name_update = Some(ServerEvent::UserUpdated {
                    user_id: participant_id.to_string(),
                    display_name: display_name.to_string(),
                });
            }
        }
        if let Some(event) = name_update {
            self.broadcast_except(participant_id, &event);
            self.persist();
        }

        let ready_name = self
            .participants
            .get(participant_id)
            .map(|p| p.display_name.clone())
            .unwrap_or_default();
        let event = ServerEvent::InitiateOffer {
            target: participant_id.to_string(),
            display_name: ready_name,
        };

        for p in self.participants.values() {
            if p.participant_id != participant_id && p.status == ParticipantStatus::Active {
                self.send_signal(p, &event, "initiate_offer");
            }
        }

        self.last_active_at = Utc::now();
        debug!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            "Ready fanned out"
        );
    }

    /// Handle an explicit leave (immediate removal, no grace).
    #[instrument(skip_all, fields(room_id = %self.room_id))]
    fn handle_leave(&mut self, participant_id: &str) -> Result<(), SwitchboardError> {
        let Some(removed) = self.participants.remove(participant_id) else {
            return Err(SwitchboardError::NotInRoom);
        };

        self.cancel_grace_timer(participant_id);
        metrics::decrement_participants_active();

        self.broadcast_except(
            participant_id,
            &ServerEvent::UserLeft {
                user_id: participant_id.to_string(),
                display_name: removed.display_name,
            },
        );

        self.analytics.publish(AnalyticsEvent::ParticipantLeft {
            room_id: self.room_id.clone(),
            user_id: participant_id.to_string(),
            reason: "left",
        });

        self.last_active_at = Utc::now();
        if self.participants.is_empty() {
            self.emptied = true;
        } else {
            self.persist();
        }

        info!(
            target: "sb.actor.room",
            remaining_participants = self.participants.len(),
            "Participant left"
        );

        Ok(())
    }

    /// Handle a dropped transport connection: flag inactive, start the
    /// grace timer, tell the peers.
    fn handle_disconnected(&mut self, participant_id: &str) {
        let display_name = {
            let Some(participant) = self.participants.get_mut(participant_id) else {
                debug!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    "Disconnect for unknown participant, ignored"
                );
                return;
            };
            if participant.status == ParticipantStatus::Inactive {
                // Duplicate disconnect; the timer is already running.
                return;
            }
            participant.status = ParticipantStatus::Inactive;
            participant.disconnected_at = Some(Utc::now());
            participant.sender = None;
            participant.display_name.clone()
        };

        self.schedule_grace_timer(participant_id);

        self.broadcast_except(
            participant_id,
            &ServerEvent::UserInactive {
                user_id: participant_id.to_string(),
                display_name,
            },
        );

        self.last_active_at = Utc::now();
        self.persist();

        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            grace_seconds = self.grace_period.as_secs(),
            "Participant disconnected, grace period started"
        );
    }

    /// Handle a fired grace timer.
    ///
    /// Re-checks state under the room's serialization: a participant who
    /// rejoined (or was removed) between the timer firing and this message
    /// being processed makes it a no-op.
    fn handle_grace_expired(&mut self, participant_id: &str) {
        self.grace_timers.remove(participant_id);

        let still_inactive = self
            .participants
            .get(participant_id)
            .is_some_and(|p| p.status == ParticipantStatus::Inactive);
        if !still_inactive {
            debug!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Grace expiry superseded, ignored"
            );
            return;
        }

        let Some(removed) = self.participants.remove(participant_id) else {
            return;
        };
        metrics::decrement_participants_active();
        metrics::increment_grace_removals();

        self.broadcast_except(
            participant_id,
            &ServerEvent::UserLeft {
                user_id: participant_id.to_string(),
                display_name: removed.display_name,
            },
        );

        self.analytics.publish(AnalyticsEvent::ParticipantLeft {
            room_id: self.room_id.clone(),
            user_id: participant_id.to_string(),
            reason: "grace_expired",
        });

        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            remaining_participants = self.participants.len(),
            "Grace period expired, participant removed"
        );

        if self.participants.is_empty() {
            self.emptied = true;
        } else {
            self.persist();
        }
    }

    /// Relay a signaling payload toward `target`, which must be active
    /// here. Anything else is dropped without notifying the sender.
    fn handle_relay(
        &mut self,
        from: &str,
        kind: SignalKind,
        target: &str,
        payload: serde_json::Value,
        display_name: Option<String>,
    ) {
        let Some(sender_record) = self.participants.get(from) else {
            debug!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                kind = kind.as_str(),
                "Signal from unknown participant, dropped"
            );
            metrics::increment_signals_dropped("unknown_sender");
            return;
        };

        let from_name = display_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| sender_record.display_name.clone());

        match self.participants.get(target) {
            None => {
                debug!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    kind = kind.as_str(),
                    "Signal target not in room, dropped"
                );
                metrics::increment_signals_dropped("unknown_target");
            }
            Some(t) if t.status != ParticipantStatus::Active => {
                debug!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    kind = kind.as_str(),
                    "Signal target inactive, dropped"
                );
                metrics::increment_signals_dropped("inactive_target");
            }
            Some(t) => {
                let event = match kind {
                    SignalKind::Offer => ServerEvent::Offer {
                        from: from.to_string(),
                        payload,
                        display_name: from_name,
                    },
                    SignalKind::Answer => ServerEvent::Answer {
                        from: from.to_string(),
                        payload,
                        display_name: from_name,
                    },
                    SignalKind::IceCandidate => ServerEvent::IceCandidate {
                        from: from.to_string(),
                        payload,
                        display_name: from_name,
                    },
                };
                self.send_signal(t, &event, kind.as_str());
            }
        }

        self.last_active_at = Utc::now();
    }

    /// Get current room state.
    fn get_state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            creator_identity: self.creator_identity.clone(),
            is_password_protected: self.password.is_some(),
            participants: self
                .participants
                .values()
                .map(Participant::to_detail)
                .collect(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }

    /// Snapshot of everyone except `except` (the recipient already knows
    /// about themselves).
    fn snapshot_for(&self, except: &str) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            participants: self
                .participants
                .values()
                .filter(|p| p.participant_id != except)
                .map(Participant::to_summary)
                .collect(),
            is_password_protected: self.password.is_some(),
        }
    }

    /// Start a cancellable grace timer for `participant_id`.
    ///
    /// The timer is a spawned sleep that posts an expiry message back into
    /// this room's mailbox; the expiry handler re-checks state, so a timer
    /// that loses the race to a rejoin is harmless.
    fn schedule_grace_timer(&mut self, participant_id: &str) {
        self.cancel_grace_timer(participant_id);

        let token = CancellationToken::new();
        self.grace_timers
            .insert(participant_id.to_string(), token.clone());

        let mailbox = self.self_sender.clone();
        let grace_period = self.grace_period;
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(grace_period) => {
                    let _ = mailbox
                        .send(RoomMessage::GraceExpired { participant_id })
                        .await;
                }
            }
        });
    }

    /// Cancel any outstanding grace timer for `participant_id`.
    fn cancel_grace_timer(&mut self, participant_id: &str) {
        if let Some(token) = self.grace_timers.remove(participant_id) {
            token.cancel();
        }
    }

    /// Broadcast a lifecycle event to everyone except one participant.
    ///
    /// Delivery is `try_send`: a slow client loses events rather than
    /// stalling the room.
    fn broadcast_except(&self, except_participant_id: &str, event: &ServerEvent) {
        for participant in self.participants.values() {
            if participant.participant_id == except_participant_id {
                continue;
            }
            let Some(sender) = &participant.sender else {
                continue;
            };
            if sender.try_send(event.clone()).is_err() {
                debug!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant.participant_id,
                    event = event.kind(),
                    "Lifecycle event dropped, client channel full"
                );
            }
        }
    }

    /// Deliver one signaling event to one participant, counting the
    /// outcome.
    fn send_signal(&self, participant: &Participant, event: &ServerEvent, kind: &'static str) {
        let Some(sender) = &participant.sender else {
            metrics::increment_signals_dropped("no_sender");
            return;
        };
        match sender.try_send(event.clone()) {
            Ok(()) => metrics::increment_signals_relayed(kind),
            Err(_) => {
                debug!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    target_id = %participant.participant_id,
                    kind,
                    "Signal dropped, client channel full"
                );
                metrics::increment_signals_dropped("backpressure");
            }
        }
    }

    /// Write-through persist of the current record, fire-and-forget.
    fn persist(&self) {
        store::persist_room_best_effort(&self.store, self.room_record());
    }

    fn room_record(&self) -> RoomRecord {
        RoomRecord {
            room_id: self.room_id.clone(),
            creator_identity: self.creator_identity.clone(),
            password: self.password.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            participants: self
                .participants
                .values()
                .map(Participant::to_record)
                .collect(),
        }
    }

    /// Close out an emptied room: refuse queued work, drop the durable
    /// record, tell the registry, exit.
    fn close_emptied(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            self.reject_after_close(message);
        }
        for (_, token) in self.grace_timers.drain() {
            token.cancel();
        }

        store::delete_room_best_effort(&self.store, self.room_id.clone());
        metrics::increment_rooms_closed("emptied");
        self.analytics.publish(AnalyticsEvent::RoomClosed {
            room_id: self.room_id.clone(),
            reason: "emptied",
        });
        let _ = self.notices.send(RegistryNotice::RoomEmptied {
            room_id: self.room_id.clone(),
        });

        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            "Room emptied, closing"
        );
    }

    /// Answer a message that raced the room's closing.
    fn reject_after_close(&self, message: RoomMessage) {
        match message {
            RoomMessage::Join { respond_to, .. } | RoomMessage::Rejoin { respond_to, .. } => {
                let _ = respond_to.send(Err(SwitchboardError::RoomClosed(self.room_id.clone())));
            }
            RoomMessage::Leave { respond_to, .. } => {
                // The participant is gone either way.
                let _ = respond_to.send(Ok(()));
            }
            RoomMessage::Verify { respond_to, .. } => {
                let _ = respond_to.send(VerifyOutcome {
                    exists: false,
                    password_ok: false,
                });
            }
            RoomMessage::Ready { .. }
            | RoomMessage::Disconnected { .. }
            | RoomMessage::Relay { .. }
            | RoomMessage::GraceExpired { .. }
            | RoomMessage::GetState { .. } => {}
        }
    }

    /// Perform graceful shutdown: stop the timers and land one final
    /// durable record so the room can rehydrate after a restart.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sb.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            "RoomActor shutting down"
        );

        for (_, token) in self.grace_timers.drain() {
            token.cancel();
        }

        // An empty room has nothing to rehydrate; leave no record behind.
        // The sweep-cancel path ends up here.
        if self.participants.is_empty() {
            let start = std::time::Instant::now();
            let result = self.store.delete_room(&self.room_id).await;
            metrics::observe_store_latency("delete_room", start.elapsed());
            if let Err(e) = result {
                warn!(
                    target: "sb.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Room record delete failed during shutdown"
                );
                metrics::increment_store_failures("delete_room");
            }
            return;
        }

        // Everyone is about to lose their connection; persist them inactive
        // so rehydration after restart hands out grace windows.
        let mut record = self.room_record();
        let now = Utc::now();
        for participant in &mut record.participants {
            participant.inactive = true;
            participant.disconnected_at.get_or_insert(now);
        }

        let start = std::time::Instant::now();
        let result = self.store.save_room(&record).await;
        metrics::observe_store_latency("save_room", start.elapsed());
        if let Err(e) = result {
            warn!(
                target: "sb.actor.room",
                room_id = %self.room_id,
                error = %e,
                "Final room persist failed during shutdown"
            );
            metrics::increment_store_failures("save_room");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sb_test_utils::MemoryStore;
    use serde_json::json;

    const GRACE: Duration = Duration::from_secs(30);

    fn test_context() -> (RoomContext, mpsc::UnboundedReceiver<RegistryNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let context = RoomContext {
            notices,
            store: Arc::new(MemoryStore::new()),
            analytics: AnalyticsPublisher::disabled(),
            grace_period: GRACE,
        };
        (context, notice_rx)
    }

    fn spawn_room(
        password: Option<&str>,
    ) -> (
        RoomActorHandle,
        JoinHandle<()>,
        mpsc::UnboundedReceiver<RegistryNotice>,
    ) {
        let (context, notice_rx) = test_context();
        let (handle, task) = RoomActor::spawn(
            "X7Q2LD".to_string(),
            "alice@example.com".to_string(),
            password.map(String::from),
            CancellationToken::new(),
            context,
        );
        (handle, task, notice_rx)
    }

    fn client() -> (ClientSender, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(64)
    }

    async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("client channel closed")
    }

    async fn settle() {
        // Let the actor drain its mailbox.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_room_actor_spawn_and_cancel() {
        let (handle, _task, _notices) = spawn_room(None);

        assert_eq!(handle.room_id(), "X7Q2LD");
        assert!(!handle.is_cancelled());

        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_first_participant_is_creator() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx, _rx) = client();

        let snapshot = handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx)
            .await
            .unwrap();
        // The joiner is not in their own snapshot.
        assert!(snapshot.participants.is_empty());

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        let creator = &state.participants[0];
        assert_eq!(creator.participant_id, "conn-1");
        assert_eq!(creator.role, ParticipantRole::Creator);
        assert_eq!(creator.status, ParticipantStatus::Active);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_second_participant_is_member() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        let snapshot = handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].user_id, "conn-1");
        assert!(!snapshot.participants[0].inactive);

        let state = handle.get_state().await.unwrap();
        let bob = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-2")
            .unwrap();
        assert_eq!(bob.role, ParticipantRole::Member);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_join_broadcasts_user_joined() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, mut rx1) = client();
        let (tx2, _rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        let event = recv_event(&mut rx1).await;
        assert_eq!(
            event,
            ServerEvent::UserJoined {
                user_id: "conn-2".to_string(),
                display_name: "Bob".to_string(),
            }
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_join_password_checked() {
        let (handle, _task, _notices) = spawn_room(Some("swordfish"));
        let (tx1, _rx1) = client();

        let denied = handle
            .join(
                "conn-1".to_string(),
                "Alice".to_string(),
                Some("wrong".to_string()),
                tx1,
            )
            .await;
        assert!(matches!(
            denied,
            Err(SwitchboardError::IncorrectPassword(_))
        ));

        let (tx2, _rx2) = client();
        let missing = handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx2)
            .await;
        assert!(matches!(
            missing,
            Err(SwitchboardError::IncorrectPassword(_))
        ));

        let (tx3, _rx3) = client();
        let accepted = handle
            .join(
                "conn-1".to_string(),
                "Alice".to_string(),
                Some("swordfish".to_string()),
                tx3,
            )
            .await;
        assert!(accepted.is_ok());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_join_idempotent_for_same_id() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx2)
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        // Role survives the refresh.
        assert_eq!(state.participants[0].role, ParticipantRole::Creator);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_marks_inactive_and_notifies_peers() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        settle().await;

        let event = recv_event(&mut rx2).await;
        assert_eq!(
            event,
            ServerEvent::UserInactive {
                user_id: "conn-1".to_string(),
                display_name: "Alice".to_string(),
            }
        );

        let state = handle.get_state().await.unwrap();
        let alice = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-1")
            .unwrap();
        assert_eq!(alice.status, ParticipantStatus::Inactive);
        assert!(alice.disconnected_at.is_some());

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_removes_participant() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        settle().await;

        // 29 seconds in: still in the room, flagged inactive.
        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        let state = handle.get_state().await.unwrap();
        assert_eq!(
            state.participants.len(),
            2,
            "participant should survive until the grace window closes"
        );

        // Past 30 seconds: removed.
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants[0].participant_id, "conn-2");

        // Bob saw the inactive flag, then the removal.
        let first = recv_event(&mut rx2).await;
        assert_eq!(first.kind(), "user_inactive");
        let second = recv_event(&mut rx2).await;
        assert_eq!(
            second,
            ServerEvent::UserLeft {
                user_id: "conn-1".to_string(),
                display_name: "Alice".to_string(),
            }
        );

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_grace_timer() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (tx3, _rx3) = client();
        handle
            .rejoin(
                "conn-3".to_string(),
                Some("Alice".to_string()),
                Some("conn-1".to_string()),
                tx3,
            )
            .await
            .unwrap();

        // Way past where the old timer would have fired.
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        let alice = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-3")
            .unwrap();
        assert_eq!(alice.status, ParticipantStatus::Active);
        assert_eq!(alice.previous_ids, vec!["conn-1".to_string()]);
        assert_eq!(alice.role, ParticipantRole::Creator);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_broadcasts_user_rejoined() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        settle().await;
        let _inactive = recv_event(&mut rx2).await;

        let (tx3, _rx3) = client();
        handle
            .rejoin(
                "conn-3".to_string(),
                None,
                Some("conn-1".to_string()),
                tx3,
            )
            .await
            .unwrap();

        let event = recv_event(&mut rx2).await;
        assert_eq!(
            event,
            ServerEvent::UserRejoined {
                user_id: "conn-3".to_string(),
                display_name: "Alice".to_string(),
            }
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_matches_previous_id_chain() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();

        // First rejoin: conn-1 -> conn-2.
        handle.disconnected("conn-1".to_string()).await;
        let (tx2, _rx2) = client();
        handle
            .rejoin(
                "conn-2".to_string(),
                None,
                Some("conn-1".to_string()),
                tx2,
            )
            .await
            .unwrap();

        // Second rejoin quotes the oldest id; the chain still finds it.
        handle.disconnected("conn-2".to_string()).await;
        let (tx3, _rx3) = client();
        handle
            .rejoin(
                "conn-3".to_string(),
                None,
                Some("conn-1".to_string()),
                tx3,
            )
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        let alice = &state.participants[0];
        assert_eq!(alice.participant_id, "conn-3");
        assert_eq!(
            alice.previous_ids,
            vec!["conn-2".to_string(), "conn-1".to_string()]
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_by_unique_display_name() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        settle().await;

        // No previous id at all; the unique inactive "Alice" still matches.
        let (tx3, _rx3) = client();
        handle
            .rejoin("conn-3".to_string(), Some("Alice".to_string()), None, tx3)
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        let alice = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-3")
            .unwrap();
        assert_eq!(alice.previous_ids, vec!["conn-1".to_string()]);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_ambiguous_display_name_joins_fresh() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();
        let (tx3, _rx3) = client();

        handle
            .join("conn-1".to_string(), "Guest".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Guest".to_string(), None, tx2)
            .await
            .unwrap();
        handle
            .join("conn-3".to_string(), "Carol".to_string(), None, tx3)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        handle.disconnected("conn-2".to_string()).await;
        settle().await;

        // Two inactive "Guest" records: ambiguous, no merge.
        let (tx4, _rx4) = client();
        handle
            .rejoin("conn-4".to_string(), Some("Guest".to_string()), None, tx4)
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 4);
        let fresh = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-4")
            .unwrap();
        assert!(fresh.previous_ids.is_empty());
        assert_eq!(fresh.role, ParticipantRole::Member);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_supersedes_active_record() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();

        // No disconnect was ever seen for conn-1, yet the client claims it.
        let (tx2, _rx2) = client();
        handle
            .rejoin(
                "conn-2".to_string(),
                None,
                Some("conn-1".to_string()),
                tx2,
            )
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        let alice = &state.participants[0];
        assert_eq!(alice.participant_id, "conn-2");
        assert_eq!(alice.status, ParticipantStatus::Active);
        assert_eq!(alice.previous_ids, vec!["conn-1".to_string()]);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_merge_prunes_same_name_duplicates() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, _rx2) = client();
        let (tx3, _rx3) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Alice".to_string(), None, tx2)
            .await
            .unwrap();
        handle
            .join("conn-3".to_string(), "Bob".to_string(), None, tx3)
            .await
            .unwrap();

        handle.disconnected("conn-1".to_string()).await;
        handle.disconnected("conn-2".to_string()).await;
        settle().await;

        // Rejoin by explicit previous id; the other inactive "Alice" is a
        // stale duplicate and goes away in the same step.
        let (tx4, _rx4) = client();
        handle
            .rejoin(
                "conn-4".to_string(),
                Some("Alice".to_string()),
                Some("conn-1".to_string()),
                tx4,
            )
            .await
            .unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        assert!(state
            .participants
            .iter()
            .all(|p| p.participant_id != "conn-2"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let (handle, task, mut notices) = spawn_room(None);
        let (tx1, _rx1) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle.leave("conn-1".to_string()).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(1), notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        assert!(matches!(
            notice,
            RegistryNotice::RoomEmptied { room_id } if room_id == "X7Q2LD"
        ));

        // The actor exits; later operations see the room as closed.
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should exit")
            .expect("room task should not panic");
        let (tx2, _rx2) = client();
        let result = handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await;
        assert!(matches!(result, Err(SwitchboardError::RoomClosed(_))));
    }

    #[tokio::test]
    async fn test_leave_unknown_participant() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();

        let result = handle.leave("conn-9".to_string()).await;
        assert!(matches!(result, Err(SwitchboardError::NotInRoom)));

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_of_last_participant_closes_room() {
        let (handle, task, mut notices) = spawn_room(None);
        let (tx1, _rx1) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle.disconnected("conn-1".to_string()).await;
        settle().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        let notice = tokio::time::timeout(Duration::from_secs(1), notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        assert!(matches!(notice, RegistryNotice::RoomEmptied { .. }));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should exit")
            .expect("room task should not panic");
    }

    #[tokio::test]
    async fn test_relay_offer_to_active_target() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        let payload = json!({"sdp": "v=0...", "type": "offer"});
        handle
            .relay(
                "conn-1".to_string(),
                SignalKind::Offer,
                "conn-2".to_string(),
                payload.clone(),
                None,
            )
            .await;

        let event = recv_event(&mut rx2).await;
        assert_eq!(
            event,
            ServerEvent::Offer {
                from: "conn-1".to_string(),
                payload,
                display_name: "Alice".to_string(),
            }
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_to_missing_or_inactive_target_is_dropped() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        // Unknown target: silently dropped.
        handle
            .relay(
                "conn-1".to_string(),
                SignalKind::Answer,
                "conn-9".to_string(),
                json!({}),
                None,
            )
            .await;

        // Inactive target: also dropped.
        handle.disconnected("conn-2".to_string()).await;
        handle
            .relay(
                "conn-1".to_string(),
                SignalKind::IceCandidate,
                "conn-2".to_string(),
                json!({"candidate": "..."}),
                None,
            )
            .await;
        settle().await;

        // Bob's channel saw only his own join-time events, no signals.
        while let Ok(event) = rx2.try_recv() {
            assert!(
                !matches!(
                    event,
                    ServerEvent::Offer { .. }
                        | ServerEvent::Answer { .. }
                        | ServerEvent::IceCandidate { .. }
                ),
                "no signal should have been delivered"
            );
        }

        handle.cancel();
    }

    #[tokio::test]
    async fn test_ready_fans_out_to_other_active_participants() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, mut rx1) = client();
        let (tx2, mut rx2) = client();
        let (tx3, _rx3) = client();

        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();
        handle
            .join("conn-3".to_string(), "Carol".to_string(), None, tx3)
            .await
            .unwrap();
        handle.disconnected("conn-3".to_string()).await;
        settle().await;

        // Drain the join/inactive noise first.
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}

        handle.ready("conn-1".to_string(), "Alice".to_string()).await;
        settle().await;

        // Bob is told to initiate toward Alice.
        let event = recv_event(&mut rx2).await;
        assert_eq!(
            event,
            ServerEvent::InitiateOffer {
                target: "conn-1".to_string(),
                display_name: "Alice".to_string(),
            }
        );

        // Alice herself gets nothing.
        assert!(rx1.try_recv().is_err());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_ready_name_change_broadcasts_user_updated() {
        let (handle, _task, _notices) = spawn_room(None);
        let (tx1, _rx1) = client();
        let (tx2, mut rx2) = client();

        handle
            .join("conn-1".to_string(), "Guest".to_string(), None, tx1)
            .await
            .unwrap();
        handle
            .join("conn-2".to_string(), "Bob".to_string(), None, tx2)
            .await
            .unwrap();

        handle.ready("conn-1".to_string(), "Alice".to_string()).await;
        settle().await;

        let event = recv_event(&mut rx2).await;
        assert_eq!(
            event,
            ServerEvent::UserUpdated {
                user_id: "conn-1".to_string(),
                display_name: "Alice".to_string(),
            }
        );

        let state = handle.get_state().await.unwrap();
        let alice = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-1")
            .unwrap();
        assert_eq!(alice.display_name, "Alice");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_verify_checks_password_without_mutation() {
        let (handle, _task, _notices) = spawn_room(Some("swordfish"));
        let (tx1, _rx1) = client();

        handle
            .join(
                "conn-1".to_string(),
                "Alice".to_string(),
                Some("swordfish".to_string()),
                tx1,
            )
            .await
            .unwrap();
        let before = handle.get_state().await.unwrap();

        let wrong = handle.verify(Some("nope".to_string())).await.unwrap();
        assert!(wrong.exists);
        assert!(!wrong.password_ok);

        let right = handle.verify(Some("swordfish".to_string())).await.unwrap();
        assert!(right.exists);
        assert!(right.password_ok);

        let after = handle.get_state().await.unwrap();
        assert_eq!(before.participants.len(), after.participants.len());
        assert_eq!(before.last_active_at, after.last_active_at);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_verify_unprotected_room_accepts_anything() {
        let (handle, _task, _notices) = spawn_room(None);

        let outcome = handle.verify(Some("anything".to_string())).await.unwrap();
        assert!(outcome.exists);
        assert!(outcome.password_ok);

        let none = handle.verify(None).await.unwrap();
        assert!(none.password_ok);

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rehydrated_participants_get_grace_window() {
        let (context, mut notices) = test_context();
        let record = RoomRecord {
            room_id: "R3STOR".to_string(),
            creator_identity: "alice@example.com".to_string(),
            password: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            participants: vec![
                ParticipantRecord {
                    user_id: "conn-1".to_string(),
                    display_name: "Alice".to_string(),
                    joined_at: Utc::now(),
                    role: ParticipantRole::Creator,
                    inactive: false,
                    disconnected_at: None,
                    previous_id: None,
                },
                ParticipantRecord {
                    user_id: "conn-2".to_string(),
                    display_name: "Bob".to_string(),
                    joined_at: Utc::now(),
                    role: ParticipantRole::Member,
                    inactive: true,
                    disconnected_at: None,
                    previous_id: Some("conn-0".to_string()),
                },
            ],
        };

        let (handle, task) =
            RoomActor::spawn_rehydrated(record, CancellationToken::new(), context);
        settle().await;

        // Everyone restored inactive, previous-id chains intact.
        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 2);
        assert!(state
            .participants
            .iter()
            .all(|p| p.status == ParticipantStatus::Inactive));
        let bob = state
            .participants
            .iter()
            .find(|p| p.participant_id == "conn-2")
            .unwrap();
        assert_eq!(bob.previous_ids, vec!["conn-0".to_string()]);

        // Alice rejoins inside the window; Bob never does.
        let (tx, _rx) = client();
        handle
            .rejoin(
                "conn-5".to_string(),
                None,
                Some("conn-1".to_string()),
                tx,
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants[0].participant_id, "conn-5");
        assert_eq!(state.participants[0].role, ParticipantRole::Creator);

        // Room still open, so no notice and no exit.
        assert!(notices.try_recv().is_err());
        handle.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rehydrated_room_empties_if_no_one_returns() {
        let (context, mut notices) = test_context();
        let record = RoomRecord {
            room_id: "R3STOR".to_string(),
            creator_identity: "alice@example.com".to_string(),
            password: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            participants: vec![ParticipantRecord {
                user_id: "conn-1".to_string(),
                display_name: "Alice".to_string(),
                joined_at: Utc::now(),
                role: ParticipantRole::Creator,
                inactive: true,
                disconnected_at: None,
                previous_id: None,
            }],
        };

        let (_handle, task) =
            RoomActor::spawn_rehydrated(record, CancellationToken::new(), context);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        let notice = tokio::time::timeout(Duration::from_secs(1), notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed");
        assert!(matches!(
            notice,
            RegistryNotice::RoomEmptied { room_id } if room_id == "R3STOR"
        ));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should exit")
            .expect("room task should not panic");
    }

    #[tokio::test]
    async fn test_final_record_persisted_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (notices, _notice_rx) = mpsc::unbounded_channel();
        let context = RoomContext {
            notices,
            store: Arc::clone(&store) as SharedStore,
            analytics: AnalyticsPublisher::disabled(),
            grace_period: GRACE,
        };

        let (handle, task) = RoomActor::spawn(
            "X7Q2LD".to_string(),
            "alice@example.com".to_string(),
            None,
            CancellationToken::new(),
            context,
        );
        let (tx, _rx) = client();
        handle
            .join("conn-1".to_string(), "Alice".to_string(), None, tx)
            .await
            .unwrap();

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should exit")
            .expect("room task should not panic");

        let record = store
            .load_room("X7Q2LD")
            .await
            .unwrap()
            .expect("final record should be persisted");
        assert_eq!(record.participants.len(), 1);
        assert!(record.participants[0].inactive);
        assert!(record.participants[0].disconnected_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_room_shutdown_deletes_record() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_room(&RoomRecord {
                room_id: "X7Q2LD".to_string(),
                creator_identity: "alice@example.com".to_string(),
                password: None,
                created_at: Utc::now(),
                last_active_at: Utc::now(),
                participants: Vec::new(),
            })
            .await
            .unwrap();
        let (notices, _notice_rx) = mpsc::unbounded_channel();
        let context = RoomContext {
            notices,
            store: Arc::clone(&store) as SharedStore,
            analytics: AnalyticsPublisher::disabled(),
            grace_period: GRACE,
        };

        let (handle, task) = RoomActor::spawn(
            "X7Q2LD".to_string(),
            "alice@example.com".to_string(),
            None,
            CancellationToken::new(),
            context,
        );

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("room task should exit")
            .expect("room task should not panic");

        assert!(
            store.load_room("X7Q2LD").await.unwrap().is_none(),
            "empty room should leave no record behind"
        );
    }
}
