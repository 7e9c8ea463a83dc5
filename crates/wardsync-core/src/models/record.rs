//! The syncable record envelope

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new record id (UUID v7, time-sortable)
#[must_use]
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Full current state of one clinical row, as moved by the sync core.
///
/// `data` is the whole payload, never a delta. Foreign keys declared in the
/// schema are read from top-level payload fields of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    pub record_type: String,
    pub record_id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub facility_id: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at_tick: i64,
    pub data: serde_json::Value,
}

impl SyncableRecord {
    /// Create a live record with a fresh id
    pub fn new(record_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self::with_id(record_type, new_record_id(), data)
    }

    /// Create a live record with a caller-chosen id
    pub fn with_id(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            patient_id: None,
            facility_id: None,
            is_deleted: false,
            updated_at_tick: 0,
            data,
        }
    }

    /// Scope the record to a patient
    #[must_use]
    pub fn for_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    /// Scope the record to a facility
    #[must_use]
    pub fn at_facility(mut self, facility_id: impl Into<String>) -> Self {
        self.facility_id = Some(facility_id.into());
        self
    }

    /// Read a top-level string field from the payload
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(serde_json::Value::as_str)
    }

    /// `Type:id` label used in logs and error messages
    pub fn label(&self) -> String {
        format!("{}:{}", self.record_type, self.record_id)
    }

    /// Whether two envelopes carry the same state (ignoring the tick)
    pub fn same_content(&self, other: &Self) -> bool {
        self.record_type == other.record_type
            && self.record_id == other.record_id
            && self.is_deleted == other.is_deleted
            && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_camel_case_on_the_wire() {
        let record = SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada"}))
            .for_patient("p1");
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["recordType"], "Patient");
        assert_eq!(encoded["recordId"], "p1");
        assert_eq!(encoded["patientId"], "p1");
        assert_eq!(encoded["isDeleted"], false);
        assert_eq!(encoded["updatedAtTick"], 0);
    }

    #[test]
    fn missing_optional_fields_default() {
        let record: SyncableRecord = serde_json::from_value(json!({
            "recordType": "Facility",
            "recordId": "f1",
            "data": {}
        }))
        .unwrap();
        assert_eq!(record.patient_id, None);
        assert!(!record.is_deleted);
        assert_eq!(record.updated_at_tick, 0);
    }

    #[test]
    fn same_content_ignores_tick() {
        let a = SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada"}));
        let mut b = a.clone();
        b.updated_at_tick = 7;
        assert!(a.same_content(&b));
        b.data = json!({"name": "Grace"});
        assert!(!a.same_content(&b));
    }
}
