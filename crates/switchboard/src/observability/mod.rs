//! Observability for the Switchboard service.
//!
//! # Privacy by Default
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit safe field
//! allow-listing. Signaling payloads (SDP, ICE candidates) are never logged;
//! they may carry IP addresses and device details. Metric labels are bounded
//! to keep cardinality low:
//! - `kind`: join kinds (created, joined, rejoined) and signal kinds
//!   (offer, answer, ice_candidate, initiate_offer)
//! - `reason`: close/drop reasons (emptied, idle, unknown_sender,
//!   unknown_target, inactive_target, backpressure, no_sender)
//! - `operation`: durable store operations (save_room, load_room,
//!   delete_room, save_session, load_session, delete_session)
//! - `actor_type`: 2 values (registry, room)
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sb_rooms_active` | Gauge | none | Rooms currently resident in the registry |
//! | `sb_participants_active` | Gauge | none | Participant records across live rooms |
//! | `sb_sessions_active` | Gauge | none | Sessions in the live cache |
//! | `sb_rooms_created_total` | Counter | none | Rooms created since startup |
//! | `sb_rooms_closed_total` | Counter | `reason` | Rooms torn down, by cause |
//! | `sb_joins_total` | Counter | `kind` | Join operations, by kind |
//! | `sb_signals_relayed_total` | Counter | `kind` | Signaling messages forwarded |
//! | `sb_signals_dropped_total` | Counter | `reason` | Signaling messages not delivered |
//! | `sb_grace_removals_total` | Counter | none | Participants removed on grace expiry |
//! | `sb_sessions_pruned_total` | Counter | none | Sessions evicted by the sweeper |
//! | `sb_store_failures_total` | Counter | `operation` | Best-effort store writes that failed |
//! | `sb_store_latency_seconds` | Histogram | `operation` | Durable store operation latency |
//! | `sb_actor_panics_total` | Counter | `actor_type` | Actor tasks that exited abnormally |
//!
//! # Analytics
//!
//! Room and participant lifecycle events cross the analytics boundary as
//! fire-and-forget [`AnalyticsEvent`]s; see [`analytics`] for the contract.

pub mod analytics;
pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use analytics::{spawn_analytics_task, AnalyticsEvent, AnalyticsPublisher};
pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
