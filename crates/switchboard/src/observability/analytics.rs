//! Analytics boundary.
//!
//! Rooms and the session layer describe lifecycle milestones as
//! [`AnalyticsEvent`]s and hand them to an [`AnalyticsPublisher`]. Publishing
//! is fire-and-forget: an unbounded channel feeds a background task that
//! emits one structured record per event at the `sb.analytics` target, where
//! the log pipeline picks them up for the external warehouse. Callers never
//! block and never see a failure; if the task is gone the event is dropped.
//!
//! Events carry ids and bounded label strings only, never display names or
//! signaling payloads.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A lifecycle milestone worth recording outside the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsEvent {
    /// A room was created.
    RoomCreated { room_id: String },
    /// A room was torn down (`reason`: emptied, idle).
    RoomClosed { room_id: String, reason: &'static str },
    /// A participant entered a room (`kind`: created, joined, rejoined).
    ParticipantJoined {
        room_id: String,
        user_id: String,
        kind: &'static str,
    },
    /// A participant left a room (`reason`: left, grace_expired).
    ParticipantLeft {
        room_id: String,
        user_id: String,
        reason: &'static str,
    },
}

impl AnalyticsEvent {
    /// Stable event name used as the `event` field of the emitted record.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room_created",
            Self::RoomClosed { .. } => "room_closed",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
        }
    }
}

/// Cheap cloneable handle for publishing events to the analytics task.
#[derive(Debug, Clone)]
pub struct AnalyticsPublisher {
    sender: mpsc::UnboundedSender<AnalyticsEvent>,
}

impl AnalyticsPublisher {
    /// Publish an event. Never blocks; drops the event if the analytics
    /// task has already exited.
    pub fn publish(&self, event: AnalyticsEvent) {
        if self.sender.send(event).is_err() {
            debug!(target: "sb.analytics", "analytics task gone, event dropped");
        }
    }

    /// A publisher with no task behind it. Every publish is a silent drop;
    /// used by tests that don't care about analytics output.
    #[must_use]
    pub fn disabled() -> Self {
        let (sender, _receiver) = mpsc::unbounded_channel();
        Self { sender }
    }
}

/// Spawn the analytics task.
///
/// Returns the publisher handle and the task's `JoinHandle` so shutdown can
/// await the drain. The task exits when `cancel` fires or every publisher
/// clone has been dropped, flushing anything still buffered first.
pub fn spawn_analytics_task(
    cancel: CancellationToken,
) -> (AnalyticsPublisher, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let task_handle = tokio::spawn(run(receiver, cancel));
    (AnalyticsPublisher { sender }, task_handle)
}

#[tracing::instrument(skip_all, name = "sb.task.analytics")]
async fn run(mut receiver: mpsc::UnboundedReceiver<AnalyticsEvent>, cancel: CancellationToken) {
    debug!(target: "sb.analytics", "analytics task started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => emit(&event),
                None => break,
            },
        }
    }
    // Flush whatever was published before the cancel won the select.
    while let Ok(event) = receiver.try_recv() {
        emit(&event);
    }
    debug!(target: "sb.analytics", "analytics task stopped");
}

fn emit(event: &AnalyticsEvent) {
    match event {
        AnalyticsEvent::RoomCreated { room_id } => {
            info!(target: "sb.analytics", event = event.name(), room_id = %room_id);
        }
        AnalyticsEvent::RoomClosed { room_id, reason } => {
            info!(target: "sb.analytics", event = event.name(), room_id = %room_id, reason);
        }
        AnalyticsEvent::ParticipantJoined {
            room_id,
            user_id,
            kind,
        } => {
            info!(
                target: "sb.analytics",
                event = event.name(),
                room_id = %room_id,
                user_id = %user_id,
                kind
            );
        }
        AnalyticsEvent::ParticipantLeft {
            room_id,
            user_id,
            reason,
        } => {
            info!(
                target: "sb.analytics",
                event = event.name(),
                room_id = %room_id,
                user_id = %user_id,
                reason
            );
        }
    }
}
