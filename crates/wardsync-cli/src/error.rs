use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] wardsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record payload must be a JSON object: {0}")]
    InvalidPayload(String),
    #[error("Record type cannot be empty")]
    EmptyRecordType,
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Facility id is not set. Pass --facility-id or set WARDSYNC_FACILITY_ID for the first sync.")]
    FacilityNotConfigured,
}
