//! Switchboard configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default so a bare `switchboard` starts against a local Redis. Sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default gateway (WebSocket) bind address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default health/metrics bind address.
pub const DEFAULT_HEALTH_ADDRESS: &str = "0.0.0.0:9090";

/// Default durable store URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default disconnect grace period in seconds.
pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default idle expiry window for sessions and empty rooms, in seconds.
pub const DEFAULT_IDLE_EXPIRY_SECONDS: u64 = 24 * 60 * 60;

/// Default expiry sweep interval in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60 * 60;

/// Switchboard configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (durable room/session store).
    /// Protected by `SecretString` because it may embed credentials.
    pub redis_url: SecretString,

    /// Gateway WebSocket bind address (default: "0.0.0.0:8080").
    pub listen_address: String,

    /// Health/metrics endpoint bind address (default: "0.0.0.0:9090").
    pub health_address: String,

    /// Disconnect grace period in seconds (default: 30).
    pub grace_period_seconds: u64,

    /// Idle expiry window for sessions and empty rooms in seconds
    /// (default: 86400, i.e. 24 hours).
    pub idle_expiry_seconds: u64,

    /// Expiry sweep interval in seconds (default: 3600).
    pub sweep_interval_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("listen_address", &self.listen_address)
            .field("health_address", &self.health_address)
            .field("grace_period_seconds", &self.grace_period_seconds)
            .field("idle_expiry_seconds", &self.idle_expiry_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("SB_REDIS_URL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        );

        let listen_address = vars
            .get("SB_LISTEN_ADDR")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

        let health_address = vars
            .get("SB_HEALTH_ADDR")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_ADDRESS.to_string());

        let grace_period_seconds =
            parse_seconds(vars, "SB_GRACE_PERIOD_SECONDS", DEFAULT_GRACE_PERIOD_SECONDS)?;
        let idle_expiry_seconds =
            parse_seconds(vars, "SB_IDLE_EXPIRY_SECONDS", DEFAULT_IDLE_EXPIRY_SECONDS)?;
        let sweep_interval_seconds = parse_seconds(
            vars,
            "SB_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?;

        Ok(Config {
            redis_url,
            listen_address,
            health_address,
            grace_period_seconds,
            idle_expiry_seconds,
            sweep_interval_seconds,
        })
    }

    /// Disconnect grace period as a `Duration`.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// Idle expiry window as a `Duration`.
    #[must_use]
    pub const fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_expiry_seconds)
    }

    /// Sweep interval as a `Duration`.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Parse a seconds value, defaulting when absent but rejecting garbage.
fn parse_seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw.clone())),
    }
}
