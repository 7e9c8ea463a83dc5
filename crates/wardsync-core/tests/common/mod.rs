//! Shared helpers for sync scenario tests

#![allow(dead_code)]

use std::sync::Mutex;

use wardsync_core::facility::{FacilityConfig, FacilitySync, SyncTransport};
use wardsync_core::protocol::{
    CompletePushResponse, InitiatePullResponse, PullPage, PushResponse, SessionReport,
    StartSyncRequest, StartSyncResponse,
};
use wardsync_core::session::StartOutcome;
use wardsync_core::{Result, SessionManager, SyncSchema, SyncSettings, SyncStore, SyncableRecord};

/// Calls the session manager directly instead of going over HTTP
pub struct LoopbackTransport {
    manager: SessionManager,
    /// Written to central right after the next snapshot is built
    interference: Mutex<Option<SyncableRecord>>,
}

impl LoopbackTransport {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            interference: Mutex::new(None),
        }
    }

    /// Have a central write land between the next pull and push
    pub fn interfere_after_snapshot(&self, record: SyncableRecord) {
        *self.interference.lock().unwrap() = Some(record);
    }
}

impl SyncTransport for LoopbackTransport {
    async fn start(&self, request: &StartSyncRequest) -> Result<StartSyncResponse> {
        Ok(match self.manager.start_session(request).await? {
            StartOutcome::Started(session) => StartSyncResponse::Started {
                session_id: session.id,
                pull_from_tick: session.pull_from_tick,
            },
            StartOutcome::Queued { position } => StartSyncResponse::WaitingInQueue { position },
        })
    }

    async fn initiate_pull(&self, session_id: &str) -> Result<InitiatePullResponse> {
        let snapshot = self.manager.initiate_pull(session_id).await?;
        let pending = self.interference.lock().unwrap().take();
        if let Some(record) = pending {
            self.manager.store().write(record).await?;
        }
        Ok(InitiatePullResponse {
            pull_until_tick: snapshot.pull_until_tick,
            total_to_pull: snapshot.total,
        })
    }

    async fn pull(&self, session_id: &str, offset: u64, limit: u32) -> Result<PullPage> {
        self.manager
            .transfer_to_facility(session_id, offset, Some(limit))
            .await
    }

    async fn push(&self, session_id: &str, records: Vec<SyncableRecord>) -> Result<PushResponse> {
        let received = self.manager.receive_push(session_id, records).await?;
        Ok(PushResponse { received })
    }

    async fn complete_push(&self, session_id: &str) -> Result<CompletePushResponse> {
        let outcome = self.manager.complete_push(session_id).await?;
        let report = self.manager.status(session_id).await?;
        Ok(CompletePushResponse {
            status: report.session.status,
            tick: outcome.tick,
            applied: outcome.applied,
        })
    }

    async fn status(&self, session_id: &str) -> Result<SessionReport> {
        self.manager.status(session_id).await
    }

    async fn abandon(&self, session_id: &str, reason: &str) -> Result<()> {
        self.manager.fail(session_id, reason).await
    }
}

pub async fn central(settings: SyncSettings) -> SessionManager {
    let store = SyncStore::open_in_memory(SyncSchema::clinical())
        .await
        .unwrap();
    SessionManager::new(store, settings)
}

/// A facility with its own empty database talking to `manager`
pub async fn facility(
    manager: &SessionManager,
    facility_id: &str,
    page_size: u32,
) -> FacilitySync<LoopbackTransport> {
    let store = SyncStore::open_in_memory(SyncSchema::clinical())
        .await
        .unwrap();
    let config =
        FacilityConfig::new(facility_id, format!("{facility_id}-device")).with_page_size(page_size);
    FacilitySync::new(store, LoopbackTransport::new(manager.clone()), config)
}
