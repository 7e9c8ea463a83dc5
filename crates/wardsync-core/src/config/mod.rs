//! Runtime settings for the sync core.
//!
//! Binaries build a [`SyncSettings`] from their own configuration surface
//! (environment variables on the central server); nothing here reads the
//! environment directly.

use std::time::Duration;

/// Capacity ceilings and timeouts for sessions and the admission queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Sessions allowed in `snapshotting` at the same time
    pub max_concurrent_snapshots: u32,
    /// Active (non-terminal) sessions allowed before devices are queued
    pub max_concurrent_sessions: u32,
    /// Sessions idle longer than this are failed by the stale sweep
    pub session_timeout: Duration,
    /// Devices promoted to `ready` must claim their slot within this window
    pub queue_claim_timeout: Duration,
    /// Upper bound on the wait in `request_snapshot_capacity`
    pub snapshot_capacity_timeout: Duration,
    /// First backoff step while waiting for snapshot capacity
    pub snapshot_poll_interval: Duration,
    /// Backoff never sleeps longer than this between polls
    pub snapshot_poll_max_interval: Duration,
    /// Records per pull page
    pub pull_page_size: u32,
    /// Pushed-tick markers older than this are pruned by the stale sweep
    pub pushed_tick_retention: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_snapshots: 4,
            max_concurrent_sessions: 8,
            session_timeout: Duration::from_secs(600),
            queue_claim_timeout: Duration::from_secs(60),
            snapshot_capacity_timeout: Duration::from_secs(120),
            snapshot_poll_interval: Duration::from_millis(100),
            snapshot_poll_max_interval: Duration::from_secs(2),
            pull_page_size: 500,
            pushed_tick_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl SyncSettings {
    /// Set the snapshot concurrency ceiling
    #[must_use]
    pub const fn with_max_concurrent_snapshots(mut self, max: u32) -> Self {
        self.max_concurrent_snapshots = max;
        self
    }

    /// Set the active session ceiling used by admission control
    #[must_use]
    pub const fn with_max_concurrent_sessions(mut self, max: u32) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Set the idle timeout after which sessions are abandoned
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the ready-slot claim timeout
    #[must_use]
    pub const fn with_queue_claim_timeout(mut self, timeout: Duration) -> Self {
        self.queue_claim_timeout = timeout;
        self
    }

    /// Set the total wait allowed for snapshot capacity, and its backoff bounds
    #[must_use]
    pub const fn with_snapshot_capacity_wait(
        mut self,
        timeout: Duration,
        poll_interval: Duration,
        poll_max_interval: Duration,
    ) -> Self {
        self.snapshot_capacity_timeout = timeout;
        self.snapshot_poll_interval = poll_interval;
        self.snapshot_poll_max_interval = poll_max_interval;
        self
    }

    /// Set the pull page size
    #[must_use]
    pub const fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Set how long pushed-tick markers are kept for facilities that stop syncing
    #[must_use]
    pub const fn with_pushed_tick_retention(mut self, retention: Duration) -> Self {
        self.pushed_tick_retention = retention;
        self
    }
}
