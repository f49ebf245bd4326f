//! Expiry sweeper background task.
//!
//! Periodically removes state nothing else will clean up:
//! 1. Sessions idle past the expiry window
//! 2. Live rooms with no participants idle past the same window (empty
//!    rooms normally close themselves immediately; this is the backstop)
//!
//! The sweeper never owns the disconnect grace removal; that belongs to the
//! room actors. Durable-store orphans are additionally covered by the TTL
//! set on every persisted record.
//!
//! # Graceful Shutdown
//!
//! The task exits cleanly when its cancellation token fires.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actors::RoomRegistryHandle;
use crate::config::Config;
use crate::observability::metrics;
use crate::sessions::SessionStore;

/// Default sweep interval in seconds (1 hour).
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 3600;

/// Default idle window in seconds (24 hours).
const DEFAULT_IDLE_EXPIRY_SECONDS: u64 = 24 * 60 * 60;

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep interval in seconds.
    pub sweep_interval_seconds: u64,
    /// Idle window in seconds before sessions and empty rooms expire.
    pub idle_expiry_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            idle_expiry_seconds: DEFAULT_IDLE_EXPIRY_SECONDS,
        }
    }
}

impl SweeperConfig {
    /// Derive the sweeper configuration from the service config.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            sweep_interval_seconds: config.sweep_interval_seconds,
            idle_expiry_seconds: config.idle_expiry_seconds,
        }
    }
}

/// Start the expiry sweeper background task.
///
/// Runs one sweep per interval tick until the cancellation token fires.
#[instrument(skip_all, name = "sb.task.sweeper")]
pub async fn start_expiry_sweeper(
    registry: RoomRegistryHandle,
    sessions: SessionStore,
    config: SweeperConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sb.task.sweeper",
        sweep_interval_seconds = config.sweep_interval_seconds,
        idle_expiry_seconds = config.idle_expiry_seconds,
        "Starting expiry sweeper task"
    );

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds));
    // The first tick fires immediately; skip straight to waiting.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_sweep(&registry, &sessions, &config).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sb.task.sweeper",
                    "Expiry sweeper received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "sb.task.sweeper", "Expiry sweeper stopped");
}

/// Run a single sweep iteration.
///
/// Separated from the loop for direct testing.
pub(crate) async fn run_sweep(
    registry: &RoomRegistryHandle,
    sessions: &SessionStore,
    config: &SweeperConfig,
) {
    let idle_seconds = i64::try_from(config.idle_expiry_seconds).unwrap_or(i64::MAX);
    let cutoff = Utc::now() - chrono::Duration::seconds(idle_seconds);

    let pruned = sessions.prune_idle(cutoff).await;
    if pruned > 0 {
        metrics::increment_sessions_pruned(pruned as u64);
        info!(
            target: "sb.task.sweeper",
            pruned_sessions = pruned,
            "Swept idle sessions"
        );
    }

    match registry.sweep_idle_rooms(cutoff).await {
        Ok(closed) => {
            if closed > 0 {
                info!(
                    target: "sb.task.sweeper",
                    closed_rooms = closed,
                    "Swept idle empty rooms"
                );
            }
        }
        Err(e) => {
            warn!(
                target: "sb.task.sweeper",
                error = %e,
                "Room sweep failed"
            );
        }
    }

    // Occupancy report once per sweep; the failure case is already
    // covered by the sweep warning above.
    match registry.get_stats().await {
        Ok(stats) => {
            info!(
                target: "sb.task.sweeper",
                live_rooms = stats.room_count,
                participants = stats.participant_count,
                "Sweep finished"
            );
        }
        Err(e) => {
            debug!(
                target: "sb.task.sweeper",
                error = %e,
                "Registry stats unavailable"
            );
        }
    }
}
