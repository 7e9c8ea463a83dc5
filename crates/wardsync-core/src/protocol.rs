//! Facility to central wire types (JSON, camelCase)

use serde::{Deserialize, Serialize};

use crate::admission::DeviceRequest;
use crate::models::{SessionParameters, SessionStatus, SyncSession, SyncableRecord};

/// `POST /sync/start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRequest {
    pub facility_id: String,
    pub device_id: String,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub last_synced_tick: i64,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub sync_all_patients: bool,
    #[serde(default)]
    pub patient_ids: Vec<String>,
}

impl StartSyncRequest {
    /// Queue entry for this request
    pub fn device_request(&self) -> DeviceRequest {
        DeviceRequest {
            device_id: self.device_id.clone(),
            facility_id: self.facility_id.clone(),
            urgent: self.urgent,
            last_synced_tick: self.last_synced_tick,
        }
    }

    /// Session parameters for this request
    pub fn parameters(&self) -> SessionParameters {
        SessionParameters {
            device_id: Some(self.device_id.clone()),
            is_mobile: self.is_mobile,
            sync_all_patients: self.sync_all_patients,
            patient_ids: self.patient_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum StartSyncResponse {
    Started {
        session_id: String,
        pull_from_tick: i64,
    },
    WaitingInQueue {
        position: usize,
    },
}

/// `POST /sync/:id/pull/initiate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePullResponse {
    pub pull_until_tick: i64,
    pub total_to_pull: u64,
}

/// Query string of `GET /sync/:id/pull`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    pub offset: Option<u64>,
    pub limit: Option<u32>,
}

/// One page of snapshot records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    pub records: Vec<SyncableRecord>,
    pub next_offset: u64,
    pub has_more: bool,
}

/// `POST /sync/:id/push`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub records: Vec<SyncableRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub received: usize,
}

/// `POST /sync/:id/push/complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePushResponse {
    pub status: SessionStatus,
    /// Tick the push was applied at; `None` when nothing needed applying
    pub tick: Option<i64>,
    pub applied: usize,
}

/// `GET /sync/:id/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session: SyncSession,
    pub outgoing_records: u64,
    pub incoming_records: u64,
}

/// `DELETE /sync/:id`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `GET /healthz`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub current_tick: i64,
    pub active_sessions: u64,
    /// Server wall clock, Unix seconds
    pub timestamp: i64,
}
