//! Sync session model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SyncableRecord;

/// A unique identifier for a sync session, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new unique session ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Session lifecycle.
///
/// `created → snapshot_queued → snapshotting → snapshot_ready → pushing →
/// validating → completed`; `errored` is reachable from every non-terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    SnapshotQueued,
    Snapshotting,
    SnapshotReady,
    Pushing,
    Validating,
    Completed,
    Errored,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::SnapshotQueued => "snapshot_queued",
            Self::Snapshotting => "snapshotting",
            Self::SnapshotReady => "snapshot_ready",
            Self::Pushing => "pushing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// A push with nothing to send goes straight from `snapshot_ready` to
    /// `validating`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Self::Errored)
                | (Self::Created, Self::SnapshotQueued)
                | (Self::SnapshotQueued, Self::Snapshotting)
                | (Self::Snapshotting, Self::SnapshotReady)
                | (Self::SnapshotReady | Self::Pushing, Self::Pushing | Self::Validating)
                | (Self::Validating, Self::Completed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "created" => Self::Created,
            "snapshot_queued" => Self::SnapshotQueued,
            "snapshotting" => Self::Snapshotting,
            "snapshot_ready" => Self::SnapshotReady,
            "pushing" => Self::Pushing,
            "validating" => Self::Validating,
            "completed" => Self::Completed,
            "errored" => Self::Errored,
            other => {
                return Err(crate::Error::Database(format!(
                    "unknown session status '{other}'"
                )))
            }
        };
        Ok(status)
    }
}

/// What the facility asked for when it started the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionParameters {
    pub device_id: Option<String>,
    pub is_mobile: bool,
    /// Pull every patient's records instead of only `patient_ids`
    pub sync_all_patients: bool,
    /// Patients this facility follows
    pub patient_ids: Vec<String>,
}

/// One facility sync session. Timestamps are Unix ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub facility_id: String,
    pub status: SessionStatus,
    pub start_time: i64,
    pub last_connection_time: i64,
    pub pull_from_tick: i64,
    pub pull_until_tick: Option<i64>,
    pub snapshot_started_at: Option<i64>,
    pub snapshot_completed_at: Option<i64>,
    pub push_started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub parameters: SessionParameters,
}

/// Whether a session record was sent to or received from the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record transferred within a session. Purged when the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSyncRecord {
    pub session_id: String,
    pub direction: Direction,
    pub sort_order: i64,
    pub record: SyncableRecord,
}
