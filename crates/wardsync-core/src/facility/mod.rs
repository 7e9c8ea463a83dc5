//! Facility side of a sync round.
//!
//! A round pulls everything central has for this facility, applies it locally
//! in dependency order, then pushes local changes made since the last
//! successful push. Progress facts are written only once central confirms the
//! push, so an interrupted round simply repeats.

mod transport;

pub use transport::{HttpTransport, SyncTransport};

use crate::clock::Clock;
use crate::db::{begin_immediate, finish_transaction, FactKey, LibSqlFactRepository};
use crate::error::{Error, Result};
use crate::models::{SyncTick, SyncableRecord};
use crate::protocol::{StartSyncRequest, StartSyncResponse};
use crate::records::{as_apply_failure, PulledApply, RecordStore};
use crate::service::SyncStore;
use crate::util::now_millis;

/// Who this facility is and what it follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityConfig {
    pub facility_id: String,
    pub device_id: String,
    pub urgent: bool,
    pub sync_all_patients: bool,
    pub patient_ids: Vec<String>,
    /// Records per pull request and per push batch
    pub page_size: u32,
}

impl FacilityConfig {
    pub fn new(facility_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            device_id: device_id.into(),
            urgent: false,
            sync_all_patients: true,
            patient_ids: Vec::new(),
            page_size: 500,
        }
    }

    /// Only pull records of these patients
    #[must_use]
    pub fn following(mut self, patient_ids: Vec<String>) -> Self {
        self.sync_all_patients = false;
        self.patient_ids = patient_ids;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

/// What one round did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub session_id: String,
    pub pull_until_tick: i64,
    pub pulled: usize,
    pub applied: usize,
    /// Pulled records ignored because a local edit is still unpushed
    pub skipped: usize,
    pub pushed: usize,
    /// Central tick the push landed at
    pub push_tick: Option<i64>,
}

/// How far behind this facility may be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staleness {
    /// Local ticks allocated since the last successful push
    pub unpushed_ticks: i64,
    /// Unix ms of the last completed round
    pub last_sync_time: Option<i64>,
    pub millis_since_sync: Option<i64>,
    pub last_pull_tick: i64,
}

/// Runs sync rounds for one facility against a transport
pub struct FacilitySync<T> {
    store: SyncStore,
    transport: T,
    config: FacilityConfig,
}

impl<T: SyncTransport> FacilitySync<T> {
    pub const fn new(store: SyncStore, transport: T, config: FacilityConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one full round.
    ///
    /// Returns `AdmissionDenied` when central queued the device; retry after a
    /// pause. Any failure after the session started abandons it on central.
    pub async fn run(&self) -> Result<SyncReport> {
        let last_pull = self.fact(FactKey::LastSuccessfulSyncPull).await?;
        let request = StartSyncRequest {
            facility_id: self.config.facility_id.clone(),
            device_id: self.config.device_id.clone(),
            urgent: self.config.urgent,
            last_synced_tick: last_pull,
            is_mobile: false,
            sync_all_patients: self.config.sync_all_patients,
            patient_ids: self.config.patient_ids.clone(),
        };

        let session_id = match self.transport.start(&request).await? {
            StartSyncResponse::Started { session_id, .. } => session_id,
            StartSyncResponse::WaitingInQueue { position } => {
                tracing::info!(
                    facility_id = %self.config.facility_id,
                    position,
                    "Waiting in central sync queue"
                );
                return Err(Error::AdmissionDenied { position });
            }
        };

        match self.run_session(&session_id).await {
            Ok(report) => Ok(report),
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    facility_id = %self.config.facility_id,
                    %error,
                    "Sync round failed"
                );
                if let Err(abandon_error) =
                    self.transport.abandon(&session_id, &error.to_string()).await
                {
                    tracing::debug!(
                        session_id = %session_id,
                        error = %abandon_error,
                        "Could not abandon session"
                    );
                }
                Err(error)
            }
        }
    }

    async fn run_session(&self, session_id: &str) -> Result<SyncReport> {
        let page_size = self.config.page_size.max(1);
        let snapshot = self.transport.initiate_pull(session_id).await?;

        let mut pulled = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.transport.pull(session_id, offset, page_size).await?;
            offset = page.next_offset;
            pulled.extend(page.records);
            if !page.has_more {
                break;
            }
        }

        let last_push = self.fact(FactKey::LastSuccessfulSyncPush).await?;
        let (applied, push_until, outgoing) = self.apply_and_collect(&pulled, last_push).await?;

        for batch in outgoing.chunks(page_size as usize) {
            self.transport.push(session_id, batch.to_vec()).await?;
        }
        let completed = self.transport.complete_push(session_id).await?;

        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let facts = LibSqlFactRepository::new(conn);
            facts
                .set_i64(FactKey::LastSuccessfulSyncPull, snapshot.pull_until_tick)
                .await?;
            facts
                .set_i64(FactKey::LastSuccessfulSyncPush, push_until)
                .await?;
            facts
                .set_i64(FactKey::LastSuccessfulSyncTime, now_millis())
                .await?;
            Ok::<_, Error>(())
        }
        .await;
        finish_transaction(conn, result).await?;
        drop(db);

        let report = SyncReport {
            session_id: session_id.to_string(),
            pull_until_tick: snapshot.pull_until_tick,
            pulled: pulled.len(),
            applied: applied.applied,
            skipped: applied.skipped,
            pushed: outgoing.len(),
            push_tick: completed.tick,
        };
        tracing::info!(
            session_id,
            facility_id = %self.config.facility_id,
            pull_until_tick = report.pull_until_tick,
            pulled = report.pulled,
            pushed = report.pushed,
            "Sync round completed"
        );
        Ok(report)
    }

    /// Apply pulled records and fix the local range to push, atomically.
    ///
    /// The allocated tick bounds the push: local writes landing after it wait
    /// for the next round.
    async fn apply_and_collect(
        &self,
        pulled: &[SyncableRecord],
        last_push: i64,
    ) -> Result<(PulledApply, i64, Vec<SyncableRecord>)> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let records = RecordStore::new(conn, self.store.schema(), self.store.graph());
            let applied = records
                .apply_pulled(pulled, last_push)
                .await
                .map_err(as_apply_failure)?;
            let push_until = Clock::new(conn).allocate_tick().await?;
            let outgoing = records
                .changed_since(last_push.max(SyncTick::ORIGIN), push_until)
                .await?;
            Ok((applied, push_until, outgoing))
        }
        .await;
        finish_transaction(conn, result).await
    }

    /// Staleness indicator at `now` (Unix ms)
    pub async fn staleness(&self, now: i64) -> Result<Staleness> {
        let db = self.store.lock().await;
        let conn = db.connection();
        let facts = LibSqlFactRepository::new(conn);
        let current = Clock::new(conn).current_tick().await?;
        let last_push = facts
            .get_i64(FactKey::LastSuccessfulSyncPush)
            .await?
            .unwrap_or(SyncTick::ORIGIN);
        let last_sync_time = facts.get_i64(FactKey::LastSuccessfulSyncTime).await?;
        let last_pull_tick = facts
            .get_i64(FactKey::LastSuccessfulSyncPull)
            .await?
            .unwrap_or(SyncTick::ORIGIN);

        Ok(Staleness {
            unpushed_ticks: (current - last_push).max(0),
            last_sync_time,
            millis_since_sync: last_sync_time.map(|time| (now - time).max(0)),
            last_pull_tick,
        })
    }

    async fn fact(&self, key: FactKey) -> Result<i64> {
        let db = self.store.lock().await;
        Ok(LibSqlFactRepository::new(db.connection())
            .get_i64(key)
            .await?
            .unwrap_or(SyncTick::ORIGIN))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::SessionStatus;
    use crate::protocol::{
        CompletePushResponse, InitiatePullResponse, PullPage, PushResponse, SessionReport,
    };
    use crate::schema::SyncSchema;

    /// Central that serves one fixed page and records abandons
    struct FixedPage {
        records: Vec<SyncableRecord>,
        abandoned: Mutex<Vec<String>>,
    }

    impl SyncTransport for FixedPage {
        async fn start(&self, _request: &StartSyncRequest) -> Result<StartSyncResponse> {
            Ok(StartSyncResponse::Started {
                session_id: "s1".to_string(),
                pull_from_tick: 0,
            })
        }

        async fn initiate_pull(&self, _session_id: &str) -> Result<InitiatePullResponse> {
            Ok(InitiatePullResponse {
                pull_until_tick: 7,
                total_to_pull: self.records.len() as u64,
            })
        }

        async fn pull(&self, _session_id: &str, _offset: u64, _limit: u32) -> Result<PullPage> {
            Ok(PullPage {
                records: self.records.clone(),
                next_offset: self.records.len() as u64,
                has_more: false,
            })
        }

        async fn push(
            &self,
            _session_id: &str,
            records: Vec<SyncableRecord>,
        ) -> Result<PushResponse> {
            Ok(PushResponse {
                received: records.len(),
            })
        }

        async fn complete_push(&self, _session_id: &str) -> Result<CompletePushResponse> {
            Ok(CompletePushResponse {
                status: SessionStatus::Completed,
                tick: None,
                applied: 0,
            })
        }

        async fn status(&self, session_id: &str) -> Result<SessionReport> {
            Err(Error::NotFound(session_id.to_string()))
        }

        async fn abandon(&self, session_id: &str, reason: &str) -> Result<()> {
            self.abandoned
                .lock()
                .unwrap()
                .push(format!("{session_id}: {reason}"));
            Ok(())
        }
    }

    async fn facility(records: Vec<SyncableRecord>) -> FacilitySync<FixedPage> {
        let store = SyncStore::open_in_memory(SyncSchema::clinical())
            .await
            .unwrap();
        let transport = FixedPage {
            records,
            abandoned: Mutex::new(Vec::new()),
        };
        FacilitySync::new(store, transport, FacilityConfig::new("fac-a", "fac-a-device"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pulled_child_without_parent_is_an_apply_failure() {
        let sync = facility(vec![SyncableRecord::with_id(
            "Encounter",
            "e1",
            json!({"patient_id": "missing"}),
        )])
        .await;

        let result = sync.run().await;
        assert!(matches!(result, Err(Error::Apply(_))), "got {result:?}");

        let abandoned = sync.transport().abandoned.lock().unwrap().clone();
        assert_eq!(abandoned.len(), 1);
        assert!(abandoned[0].starts_with("s1: Failed to apply push"));

        assert_eq!(sync.fact(FactKey::LastSuccessfulSyncPull).await.unwrap(), 0);
        assert!(sync
            .store()
            .get_record("Encounter", "e1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_applies_pulled_page_and_records_progress() {
        let sync = facility(vec![
            SyncableRecord::with_id("Encounter", "e1", json!({"patient_id": "p1"})),
            SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada"})),
        ])
        .await;

        let report = sync.run().await.unwrap();
        assert_eq!(report.pulled, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.pull_until_tick, 7);
        assert_eq!(sync.fact(FactKey::LastSuccessfulSyncPull).await.unwrap(), 7);
        assert!(sync.transport().abandoned.lock().unwrap().is_empty());
    }
}
