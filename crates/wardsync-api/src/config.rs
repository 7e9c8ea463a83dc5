use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use wardsync_core::SyncSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub sync: SyncSettings,
    pub lookup_refresh_interval: Duration,
    pub queue_sweep_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "WARDSYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "WARDSYNC_DATABASE_PATH",
            "wardsync-central.db",
        ));

        let max_concurrent_snapshots =
            bounded_u32(&lookup, "SYNC_MAX_CONCURRENT_SNAPSHOTS", 4, 1..=64)?;
        let max_concurrent_sessions =
            bounded_u32(&lookup, "SYNC_MAX_CONCURRENT_SESSIONS", 8, 1..=256)?;
        let session_timeout_secs =
            bounded_u64(&lookup, "SYNC_SESSION_TIMEOUT_SECS", 600, 30..=86_400)?;
        let queue_claim_timeout_secs =
            bounded_u64(&lookup, "SYNC_QUEUE_CLAIM_TIMEOUT_SECS", 60, 5..=3_600)?;
        let snapshot_capacity_timeout_secs =
            bounded_u64(&lookup, "SYNC_SNAPSHOT_CAPACITY_TIMEOUT_SECS", 120, 1..=3_600)?;
        let pull_page_size = bounded_u32(&lookup, "SYNC_PULL_PAGE_SIZE", 500, 1..=10_000)?;
        let lookup_refresh_secs =
            bounded_u64(&lookup, "SYNC_LOOKUP_REFRESH_INTERVAL_SECS", 30, 1..=3_600)?;
        let queue_sweep_secs = bounded_u64(&lookup, "SYNC_QUEUE_SWEEP_INTERVAL_SECS", 5, 1..=600)?;
        let pushed_tick_retention_secs = bounded_u64(
            &lookup,
            "SYNC_PUSHED_TICK_RETENTION_SECS",
            7 * 86_400,
            3_600..=365 * 86_400,
        )?;

        let defaults = SyncSettings::default();
        let sync = SyncSettings::default()
            .with_max_concurrent_snapshots(max_concurrent_snapshots)
            .with_max_concurrent_sessions(max_concurrent_sessions)
            .with_session_timeout(Duration::from_secs(session_timeout_secs))
            .with_queue_claim_timeout(Duration::from_secs(queue_claim_timeout_secs))
            .with_snapshot_capacity_wait(
                Duration::from_secs(snapshot_capacity_timeout_secs),
                defaults.snapshot_poll_interval,
                defaults.snapshot_poll_max_interval,
            )
            .with_pull_page_size(pull_page_size)
            .with_pushed_tick_retention(Duration::from_secs(pushed_tick_retention_secs));

        Ok(Self {
            bind_addr,
            database_path,
            sync,
            lookup_refresh_interval: Duration::from_secs(lookup_refresh_secs),
            queue_sweep_interval: Duration::from_secs(queue_sweep_secs),
        })
    }
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn bounded_u32(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
    range: RangeInclusive<u32>,
) -> Result<u32, ConfigError> {
    let value = bounded_u64(
        lookup,
        name,
        u64::from(default),
        u64::from(*range.start())..=u64::from(*range.end()),
    )?;
    u32::try_from(value).map_err(|_| ConfigError::Invalid(format!("{name} is out of range")))
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
