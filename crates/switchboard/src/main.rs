//! Switchboard
//!
//! Stateful WebSocket signaling server for room coordination and WebRTC
//! session negotiation.
//!
//! # Servers
//!
//! Switchboard runs two servers:
//! - WebSocket gateway for client signaling (default: 0.0.0.0:8080)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:9090)
//!
//! # Architecture
//!
//! Uses an actor model hierarchy:
//! - `RoomRegistryActor` (singleton): owns the live room map
//! - `RoomActor` (per room): owns participant state and grace timers
//!
//! # State Management
//!
//! - Live state in memory, authoritative for signaling
//! - Write-through persistence to Redis with a TTL backstop
//! - Sessions and rooms survive restarts through rehydration
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the Redis durable store
//! 4. Spawn the analytics forwarder and the room registry
//! 5. Start the expiry sweeper
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start the WebSocket gateway
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::ExposeSecret;
use switchboard::actors::RoomRegistryActor;
use switchboard::config::Config;
use switchboard::gateway::{gateway_router, GatewayState};
use switchboard::observability::metrics::increment_actor_panics;
use switchboard::observability::{
    health_router, init_metrics_recorder, spawn_analytics_task, HealthState,
};
use switchboard::sessions::SessionStore;
use switchboard::store::{RedisStore, SharedStore};
use switchboard::tasks::{start_expiry_sweeper, SweeperConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Durable records outlive the idle window by this factor. The TTL is a
/// backstop behind the sweeper, not the primary expiry.
const RECORD_TTL_FACTOR: u32 = 2;

/// How long shutdown waits for actors and servers to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Per-task timeout when collecting background tasks at shutdown.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Switchboard");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        listen_address = %config.listen_address,
        health_address = %config.health_address,
        grace_period_seconds = config.grace_period_seconds,
        idle_expiry_seconds = config.idle_expiry_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Root token; cancelling it unwinds every subsystem
    let shutdown_token = CancellationToken::new();

    // Connect the durable store. Startup fails fast when Redis is down;
    // a store that degrades later is tolerated at the call sites.
    info!("Connecting to Redis...");
    let record_ttl = config.idle_expiry() * RECORD_TTL_FACTOR;
    let store = RedisStore::connect(config.redis_url.expose_secret(), record_ttl)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    let store: SharedStore = Arc::new(store);
    info!("Redis connection established");

    // Analytics forwarder (fire-and-forget event sink)
    let (analytics, analytics_task) = spawn_analytics_task(shutdown_token.child_token());

    // Spawn the room registry
    info!("Spawning room registry...");
    let (registry, registry_task) = RoomRegistryActor::spawn(
        Arc::clone(&store),
        analytics,
        config.grace_period(),
        shutdown_token.child_token(),
    );
    let sessions = SessionStore::new(Arc::clone(&store));
    info!("Room registry spawned");

    // A dead registry means the service cannot do its job anymore; flip
    // liveness so the orchestrator restarts the process.
    let watchdog_health = Arc::clone(&health_state);
    let watchdog_token = shutdown_token.clone();
    tokio::spawn(async move {
        let outcome = registry_task.await;
        if !watchdog_token.is_cancelled() {
            if outcome.is_err() {
                increment_actor_panics("registry");
            }
            error!(panicked = outcome.is_err(), "Room registry exited unexpectedly");
            watchdog_health.set_not_live();
        }
    });

    // Start the expiry sweeper
    let sweeper_task = tokio::spawn(start_expiry_sweeper(
        registry.clone(),
        sessions.clone(),
        SweeperConfig::from_config(&config),
        shutdown_token.child_token(),
    ));
    info!("Expiry sweeper started");

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    // This provides liveness/readiness probes and the Prometheus /metrics endpoint
    let health_addr: SocketAddr = config.health_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    // Add /metrics endpoint served by the Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start the WebSocket gateway
    let gateway_addr: SocketAddr = config.listen_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.listen_address, "Invalid gateway bind address");
        format!("Invalid gateway bind address: {e}")
    })?;

    let gateway_app = gateway_router(GatewayState {
        registry,
        sessions,
        shutdown: shutdown_token.child_token(),
    });

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %gateway_addr, "Failed to bind gateway");
            format!("Failed to bind gateway to {gateway_addr}: {e}")
        })?;
    info!(addr = %gateway_addr, "Gateway bound successfully");

    let gateway_shutdown = shutdown_token.child_token();
    let gateway_task = tokio::spawn(async move {
        info!(addr = %gateway_addr, "Gateway starting");
        let server =
            axum::serve(gateway_listener, gateway_app).with_graceful_shutdown(async move {
                gateway_shutdown.cancelled().await;
                info!("Gateway shutting down");
            });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway failed");
        }
    });

    health_state.set_ready();

    // Wait for shutdown signal
    info!("Switchboard running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the orchestrator stops sending traffic
    health_state.set_not_ready();

    // Cancelling the root token propagates to all child tokens: the
    // gateway's sockets, the registry (which drains its rooms and
    // persists final records), the sweeper and the servers.
    shutdown_token.cancel();

    // Give the registry time to drain its rooms
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    if tokio::time::timeout(TASK_STOP_TIMEOUT, gateway_task)
        .await
        .is_err()
    {
        warn!("Gateway did not stop in time");
    }
    if tokio::time::timeout(TASK_STOP_TIMEOUT, sweeper_task)
        .await
        .is_err()
    {
        warn!("Expiry sweeper did not stop in time");
    }
    if tokio::time::timeout(TASK_STOP_TIMEOUT, analytics_task)
        .await
        .is_err()
    {
        warn!("Analytics forwarder did not stop in time");
    }

    info!("Switchboard shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
