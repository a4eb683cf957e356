use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tracing::warn;

use crate::model::Ms;

/// Settings that shape how records are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Offset for timestamps without one, and for calendar-date matching.
    pub utc_offset: FixedOffset,
    /// Applied when a record has neither `endTime` nor `durationMinutes`.
    pub default_duration_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            default_duration_ms: 60 * 60_000,
        }
    }
}

/// Exponential backoff for the snapshot fetch.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    /// Longest the driver sleeps without re-reading the clock, so wall-clock
    /// jumps are noticed even when no transition is due.
    pub resync_interval: Duration,
    pub command_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            resync_interval: Duration::from_secs(60),
            command_buffer: 1024,
        }
    }
}

/// Process-level configuration read from `CHARGEWATCH_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub driver: DriverConfig,
    pub snapshot_file: Option<PathBuf>,
    pub charger_ids: Option<Vec<String>>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<i64>().ok());

        let mut config = Config::default();

        if let Some(minutes) = parsed("CHARGEWATCH_UTC_OFFSET_MINUTES") {
            let secs = minutes.checked_mul(60).and_then(|s| i32::try_from(s).ok());
            match secs.and_then(FixedOffset::east_opt) {
                Some(offset) => config.driver.engine.utc_offset = offset,
                None => warn!(minutes, "ignoring out-of-range CHARGEWATCH_UTC_OFFSET_MINUTES"),
            }
        }
        if let Some(minutes) = parsed("CHARGEWATCH_DEFAULT_DURATION_MINUTES").filter(|m| *m > 0) {
            match minutes.checked_mul(60_000) {
                Some(ms) => config.driver.engine.default_duration_ms = ms,
                None => warn!(minutes, "ignoring out-of-range CHARGEWATCH_DEFAULT_DURATION_MINUTES"),
            }
        }
        if let Some(secs) = parsed("CHARGEWATCH_RESYNC_SECS").filter(|s| *s > 0) {
            config.driver.resync_interval = Duration::from_secs(secs as u64);
        }
        if let Some(attempts) = parsed("CHARGEWATCH_SNAPSHOT_ATTEMPTS").filter(|a| *a > 0) {
            config.driver.retry.max_attempts = attempts.min(u32::MAX as i64) as u32;
        }
        config.snapshot_file = lookup("CHARGEWATCH_SNAPSHOT_FILE").map(PathBuf::from);
        config.charger_ids = lookup("CHARGEWATCH_CHARGERS").map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        });
        config.metrics_port = lookup("CHARGEWATCH_METRICS_PORT").and_then(|s| s.parse().ok());
        config
    }
}
