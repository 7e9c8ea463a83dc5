//! Sync lookup entry model

use serde::{Deserialize, Serialize};

use super::SyncableRecord;

/// Denormalized metadata for one syncable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLookupEntry {
    pub record_type: String,
    pub record_id: String,
    pub patient_id: Option<String>,
    pub facility_id: Option<String>,
    pub is_deleted: bool,
    pub updated_at_tick: i64,
    /// Serialized payload as of the last rebuild
    pub data: String,
}

impl SyncLookupEntry {
    /// Turn the entry back into a transferable envelope
    pub fn into_record(self) -> crate::Result<SyncableRecord> {
        Ok(SyncableRecord {
            data: serde_json::from_str(&self.data)?,
            record_type: self.record_type,
            record_id: self.record_id,
            patient_id: self.patient_id,
            facility_id: self.facility_id,
            is_deleted: self.is_deleted,
            updated_at_tick: self.updated_at_tick,
        })
    }
}
