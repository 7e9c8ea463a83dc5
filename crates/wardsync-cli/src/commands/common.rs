use std::path::{Path, PathBuf};

use serde::Serialize;
use wardsync_core::{SyncSchema, SyncStore, SyncableRecord};

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct RecordItem {
    pub record_type: String,
    pub record_id: String,
    pub patient_id: Option<String>,
    pub facility_id: Option<String>,
    pub is_deleted: bool,
    pub updated_at_tick: i64,
    pub data: serde_json::Value,
}

pub fn record_to_item(record: &SyncableRecord) -> RecordItem {
    RecordItem {
        record_type: record.record_type.clone(),
        record_id: record.record_id.clone(),
        patient_id: record.patient_id.clone(),
        facility_id: record.facility_id.clone(),
        is_deleted: record.is_deleted,
        updated_at_tick: record.updated_at_tick,
        data: record.data.clone(),
    }
}

pub fn format_record_lines(record: &SyncableRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "{}  tick {}{}",
        record.label(),
        record.updated_at_tick,
        if record.is_deleted { "  (deleted)" } else { "" }
    )];
    if let Some(patient_id) = record.patient_id.as_deref() {
        lines.push(format!("  patient:  {patient_id}"));
    }
    if let Some(facility_id) = record.facility_id.as_deref() {
        lines.push(format!("  facility: {facility_id}"));
    }
    lines.push(format!("  data:     {}", record.data));
    lines
}

/// Parse a record payload; only JSON objects are accepted
pub fn parse_payload(raw: &str) -> Result<serde_json::Value, CliError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidPayload(format!("got {value}")))
    }
}

pub fn normalize_record_type(raw: &str) -> Result<String, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordType)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Human-readable age of a timestamp
pub fn format_elapsed(millis: i64) -> String {
    let secs = millis.max(0) / 1000;
    match secs {
        0..=59 => "just now".to_string(),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("wardsync-facility.db"),
        |dir| dir.join("wardsync").join("facility.db"),
    )
}

pub fn resolve_db_path(db_path: Option<PathBuf>) -> PathBuf {
    db_path.unwrap_or_else(default_db_path)
}

pub async fn open_store(path: &Path) -> Result<SyncStore, CliError> {
    Ok(SyncStore::open_path(path, SyncSchema::clinical()).await?)
}
