//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `RATCHET_DATABASE_URL`: PostgreSQL connection string (required)
//! - `RATCHET_POLL_INTERVAL_MS`: Due-scan tick interval (default: 10000)
//! - `RATCHET_STALE_AFTER_SECS`: Age after which an in-progress execution
//!   is presumed abandoned and reclaimed (default: 3600)
//! - `RATCHET_LOOKBACK_DAYS`: Window beyond which completed executions no
//!   longer count for due-time computation (default: 7)
//! - `RATCHET_TENANT_SCOPE`: Restrict the scan to one tenant (optional)

use std::{env, time::Duration};

use anyhow::{Context, Result};

use crate::scheduler::SchedulerConfig;

/// Default due-scan tick interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Default staleness threshold in seconds (60 minutes).
pub const DEFAULT_STALE_AFTER_SECS: i64 = 3_600;

/// Default due-check lookback window in days.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 7;

/// Scheduler process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Due-scan tick interval in milliseconds
    pub poll_interval_ms: u64,

    /// Staleness threshold for reclaiming abandoned executions (seconds)
    pub stale_after_secs: i64,

    /// Due-check lookback window (days)
    pub lookback_days: i64,

    /// Restrict scheduling to a single tenant
    pub tenant_scope: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("RATCHET_DATABASE_URL")
            .context("RATCHET_DATABASE_URL environment variable is required")?;

        let poll_interval_ms = env::var("RATCHET_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let stale_after_secs = env::var("RATCHET_STALE_AFTER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STALE_AFTER_SECS);

        let lookback_days = env::var("RATCHET_LOOKBACK_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LOOKBACK_DAYS);

        let tenant_scope = env::var("RATCHET_TENANT_SCOPE").ok().filter(|s| !s.is_empty());

        Ok(Self {
            database_url,
            poll_interval_ms,
            stale_after_secs,
            lookback_days,
            tenant_scope,
        })
    }

    /// Scheduler policy knobs derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: chrono::Duration::seconds(self.stale_after_secs),
            lookback: chrono::Duration::days(self.lookback_days),
            tenant_scope: self.tenant_scope.clone(),
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            poll_interval_ms: 50,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            tenant_scope: None,
        }
    }
}
