//! Error types for wardsync-core

use thiserror::Error;

use crate::models::SessionStatus;

/// Result type alias using wardsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in wardsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or session not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record type catalog is inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// Record types depend on each other in a cycle
    #[error("Dependency cycle between record types: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A write landed on a pulled or pushed record after the session's snapshot
    #[error(
        "Race condition in session {session_id}: {} changed after tick {pull_until_tick}",
        .records.join(", ")
    )]
    RaceCondition {
        session_id: String,
        pull_until_tick: i64,
        records: Vec<String>,
    },

    /// A capacity slot did not free up in time
    #[error("Timed out after {waited_ms}ms waiting for {resource} capacity")]
    CapacityTimeout {
        resource: &'static str,
        waited_ms: u64,
    },

    /// Device must wait in the admission queue
    #[error("Device is waiting in the sync queue at position {position}")]
    AdmissionDenied { position: usize },

    /// Push could not be applied; the transaction was rolled back
    #[error("Failed to apply push: {0}")]
    Apply(String),

    /// Session state machine rejected a transition
    #[error("Session {session_id} cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    /// HTTP transport error
    #[error("Sync transport HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Central server answered with an error
    #[error("Sync transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether the caller should simply try the sync again later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RaceCondition { .. }
                | Self::CapacityTimeout { .. }
                | Self::AdmissionDenied { .. }
                | Self::Http(_)
                | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_condition_lists_records() {
        let error = Error::RaceCondition {
            session_id: "s1".to_string(),
            pull_until_tick: 10,
            records: vec!["Patient:a".to_string(), "Encounter:b".to_string()],
        };
        let message = error.to_string();
        assert!(message.contains("Patient:a, Encounter:b"));
        assert!(message.contains("tick 10"));
        assert!(error.is_retryable());
    }

    #[test]
    fn cycles_are_not_retryable() {
        let error = Error::DependencyCycle(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            error.to_string(),
            "Dependency cycle between record types: A -> B"
        );
        assert!(!error.is_retryable());
    }
}
