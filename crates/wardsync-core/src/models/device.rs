//! Admission queue model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Position of a device in the admission queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Ready,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            other => Err(crate::Error::Database(format!(
                "unknown queue status '{other}'"
            ))),
        }
    }
}

/// A facility device waiting for permission to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueuedDevice {
    pub device_id: String,
    pub facility_id: String,
    /// Unix ms
    pub last_seen_time: i64,
    pub last_synced_tick: i64,
    pub urgent: bool,
    pub status: QueueStatus,
    /// Unix ms; FIFO key
    pub enqueued_at: i64,
    /// Unix ms; set on promotion to `ready`
    pub ready_at: Option<i64>,
}
