//! Sync session manager.
//!
//! Drives one facility session through
//! `created → snapshot_queued → snapshotting → snapshot_ready → pushing →
//! validating → completed`, failing it to `errored` from any earlier phase.
//! Each phase that writes runs in its own immediate transaction.

mod repository;

pub use repository::LibSqlSessionRepository;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::time::Instant;

use crate::admission::{Admission, AdmissionQueue, SweepSummary};
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::db::{begin_immediate, finish_transaction};
use crate::error::{Error, Result};
use crate::lookup::{LookupIndex, Visibility};
use crate::models::{
    ChangeEvent, Direction, SessionId, SessionParameters, SessionStatus, SyncSession,
    SyncableRecord,
};
use crate::protocol::{PullPage, SessionReport, StartSyncRequest};
use crate::records::{as_apply_failure, RecordStore};
use crate::reconcile;
use crate::service::SyncStore;
use crate::util::{duration_millis, now_millis};

/// Outcome of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SyncSession),
    Queued { position: usize },
}

/// A built snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub pull_until_tick: i64,
    pub total: u64,
}

/// Result of applying a push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Tick shared by every applied record; `None` when nothing was applied
    pub tick: Option<i64>,
    pub applied: usize,
    pub echoes_removed: u64,
}

/// Orchestrates sessions on the central server
#[derive(Clone)]
pub struct SessionManager {
    store: SyncStore,
    settings: SyncSettings,
}

impl SessionManager {
    pub const fn new(store: SyncStore, settings: SyncSettings) -> Self {
        Self { store, settings }
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Admit the requesting device and open a session, or queue it.
    ///
    /// A facility holds at most one open session: any it still has are
    /// failed first, which also frees their slots. Admission and session
    /// creation share one transaction so concurrent requests cannot both take
    /// the last slot.
    pub async fn start_session(&self, request: &StartSyncRequest) -> Result<StartOutcome> {
        if request.facility_id.trim().is_empty() || request.device_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "facilityId and deviceId are required".to_string(),
            ));
        }

        let now = now_millis();
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            Self::supersede_open_sessions(conn, &request.facility_id, now).await?;
            match self
                .admission_queue(conn)
                .admit(&request.device_request(), now)
                .await?
            {
                Admission::Admitted => {
                    let session = Self::insert_session(
                        conn,
                        &request.facility_id,
                        request.parameters(),
                        now,
                    )
                    .await?;
                    Ok(StartOutcome::Started(session))
                }
                Admission::Queued { position } => Ok(StartOutcome::Queued { position }),
            }
        }
        .await;
        finish_transaction(conn, result).await
    }

    /// Open a session without going through admission, replacing any open
    /// session of the facility
    pub async fn create_session(
        &self,
        facility_id: &str,
        parameters: SessionParameters,
    ) -> Result<SyncSession> {
        if facility_id.trim().is_empty() {
            return Err(Error::InvalidInput("facilityId is required".to_string()));
        }
        let now = now_millis();
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            Self::supersede_open_sessions(conn, facility_id, now).await?;
            Self::insert_session(conn, facility_id, parameters, now).await
        }
        .await;
        finish_transaction(conn, result).await
    }

    /// Fail every open session of `facility_id`; returns how many
    async fn supersede_open_sessions(
        conn: &libsql::Connection,
        facility_id: &str,
        now: i64,
    ) -> Result<usize> {
        let repo = LibSqlSessionRepository::new(conn);
        let open = repo.open_sessions_for_facility(facility_id).await?;
        for session_id in &open {
            repo.mark_errored(session_id, "superseded by a newer session", now)
                .await?;
            repo.purge_records(session_id).await?;
            tracing::info!(
                session_id = %session_id,
                facility_id,
                "Superseded open sync session"
            );
        }
        Ok(open.len())
    }

    async fn insert_session(
        conn: &libsql::Connection,
        facility_id: &str,
        parameters: SessionParameters,
        now: i64,
    ) -> Result<SyncSession> {
        let repo = LibSqlSessionRepository::new(conn);
        let pull_from_tick = repo.facility_high_water(facility_id).await?.unwrap_or(0);
        let session = SyncSession {
            id: SessionId::new().to_string(),
            facility_id: facility_id.to_string(),
            status: SessionStatus::Created,
            start_time: now,
            last_connection_time: now,
            pull_from_tick,
            pull_until_tick: None,
            snapshot_started_at: None,
            snapshot_completed_at: None,
            push_started_at: None,
            completed_at: None,
            error: None,
            parameters,
        };
        repo.insert(&session).await?;
        tracing::info!(
            session_id = %session.id,
            facility_id,
            pull_from_tick,
            "Started sync session"
        );
        Ok(session)
    }

    /// Wait until a snapshot slot is free, then move to `snapshotting`.
    ///
    /// Polls with exponential backoff, releasing the database between polls.
    /// Gives up with `CapacityTimeout` after `snapshot_capacity_timeout`,
    /// leaving the session queued so the facility can retry. Dropping the
    /// future stops the wait.
    pub async fn request_snapshot_capacity(&self, session_id: &str) -> Result<()> {
        {
            let db = self.store.lock().await;
            let repo = LibSqlSessionRepository::new(db.connection());
            let session = repo.require(session_id).await?;
            match session.status {
                SessionStatus::Snapshotting => return Ok(()),
                SessionStatus::SnapshotQueued => {}
                _ => repo.transition(&session, SessionStatus::SnapshotQueued).await?,
            }
        }

        let started = Instant::now();
        let deadline = started + self.settings.snapshot_capacity_timeout;
        let mut delay = self.settings.snapshot_poll_interval;

        loop {
            {
                let db = self.store.lock().await;
                let repo = LibSqlSessionRepository::new(db.connection());
                if repo
                    .try_claim_snapshot(
                        session_id,
                        self.settings.max_concurrent_snapshots,
                        now_millis(),
                    )
                    .await?
                {
                    tracing::debug!(
                        session_id,
                        waited_ms = started.elapsed().as_millis(),
                        "Acquired snapshot capacity"
                    );
                    return Ok(());
                }

                let session = repo.require(session_id).await?;
                if session.status != SessionStatus::SnapshotQueued {
                    return Err(Error::InvalidTransition {
                        session_id: session.id,
                        from: session.status,
                        to: SessionStatus::Snapshotting,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(session_id, waited_ms, "Snapshot capacity wait timed out");
                return Err(Error::CapacityTimeout {
                    resource: "snapshot",
                    waited_ms,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.settings.snapshot_poll_max_interval);
        }
    }

    /// Freeze the changes this facility should receive.
    ///
    /// Refreshes the lookup index, fixes `pull_until_tick` at the current
    /// tick and copies every visible change in `(pull_from, pull_until]` into
    /// the session as outgoing records. Changes the facility pushed itself are
    /// left out. Records outside the facility's scope that a sent record
    /// references are sent along, so the facility never holds a dangling
    /// foreign key.
    pub async fn build_snapshot(&self, session_id: &str) -> Result<SnapshotSummary> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let repo = LibSqlSessionRepository::new(conn);
            let session = repo.require(session_id).await?;
            if session.status != SessionStatus::Snapshotting {
                return Err(Error::InvalidTransition {
                    session_id: session.id,
                    from: session.status,
                    to: SessionStatus::SnapshotReady,
                });
            }

            let index = LookupIndex::new(conn, self.store.schema(), self.store.graph());
            index.refresh().await?;
            let pull_until_tick = Clock::new(conn).current_tick().await?;

            let visibility = Visibility::for_facility(&session.facility_id, &session.parameters);
            let own_pushes = repo
                .pushed_ticks(&session.facility_id, session.pull_from_tick, pull_until_tick)
                .await?;
            let changes = index
                .query_changes_since(session.pull_from_tick, pull_until_tick, &visibility)
                .await?
                .into_iter()
                .filter(|entry| !own_pushes.contains(&entry.updated_at_tick))
                .collect();
            let mut outgoing = Vec::new();
            for entry in index.with_hidden_parents(changes, &visibility).await? {
                let rank = self.sort_order(&entry.record_type);
                outgoing.push((rank, entry.into_record()?));
            }

            repo.insert_records(session_id, Direction::Outgoing, &outgoing)
                .await?;
            repo.mark_snapshot_ready(session_id, pull_until_tick, now_millis())
                .await?;

            Ok(SnapshotSummary {
                pull_until_tick,
                total: outgoing.len() as u64,
            })
        }
        .await;
        let summary = finish_transaction(conn, result).await?;
        drop(db);

        tracing::info!(
            session_id,
            pull_until_tick = summary.pull_until_tick,
            total = summary.total,
            "Snapshot ready"
        );
        Ok(summary)
    }

    /// Acquire capacity and build the snapshot, or report the existing one.
    ///
    /// Failures other than a capacity timeout fail the session.
    pub async fn initiate_pull(&self, session_id: &str) -> Result<SnapshotSummary> {
        let report = self.status(session_id).await?;
        if matches!(
            report.session.status,
            SessionStatus::SnapshotReady | SessionStatus::Pushing
        ) {
            if let Some(pull_until_tick) = report.session.pull_until_tick {
                return Ok(SnapshotSummary {
                    pull_until_tick,
                    total: report.outgoing_records,
                });
            }
        }

        let result = async {
            self.request_snapshot_capacity(session_id).await?;
            self.build_snapshot(session_id).await
        }
        .await;
        match result {
            Err(error @ Error::CapacityTimeout { .. }) => Err(error),
            Err(error) => Err(self.fail_with(session_id, error).await),
            ok => ok,
        }
    }

    /// One page of the snapshot in dependency order
    pub async fn transfer_to_facility(
        &self,
        session_id: &str,
        offset: u64,
        limit: Option<u32>,
    ) -> Result<PullPage> {
        let limit = limit
            .unwrap_or(self.settings.pull_page_size)
            .clamp(1, self.settings.pull_page_size.max(1));

        let db = self.store.lock().await;
        let repo = LibSqlSessionRepository::new(db.connection());
        let session = repo.require(session_id).await?;
        if !matches!(
            session.status,
            SessionStatus::SnapshotReady | SessionStatus::Pushing
        ) {
            return Err(Error::InvalidInput(format!(
                "session {session_id} has no snapshot to pull (status {})",
                session.status
            )));
        }

        let records = repo
            .load_records(session_id, Direction::Outgoing, offset, Some(limit))
            .await?;
        let total = repo.count_records(session_id, Direction::Outgoing).await?;
        repo.touch(session_id, now_millis()).await?;

        let next_offset = offset + records.len() as u64;
        Ok(PullPage {
            records,
            next_offset,
            has_more: next_offset < total,
        })
    }

    /// Store a batch of the facility's changes. May be called repeatedly.
    pub async fn receive_push(&self, session_id: &str, records: Vec<SyncableRecord>) -> Result<usize> {
        for record in &records {
            self.store.schema().model(&record.record_type)?;
            if record.record_id.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "{} record without an id",
                    record.record_type
                )));
            }
        }

        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let repo = LibSqlSessionRepository::new(conn);
            let session = repo.require(session_id).await?;
            if session.status != SessionStatus::Pushing {
                repo.transition(&session, SessionStatus::Pushing).await?;
            }
            repo.mark_pushing(session_id, now_millis()).await?;

            let incoming: Vec<(i64, SyncableRecord)> = records
                .into_iter()
                .map(|record| (self.sort_order(&record.record_type), record))
                .collect();
            repo.insert_records(session_id, Direction::Incoming, &incoming)
                .await?;
            Ok(incoming.len())
        }
        .await;
        let received = finish_transaction(conn, result).await?;
        tracing::debug!(session_id, received, "Received pushed records");
        Ok(received)
    }

    /// Drop pushed records that only echo this session's snapshot
    pub async fn reconcile_echo(&self, session_id: &str) -> Result<u64> {
        let db = self.store.lock().await;
        reconcile::reconcile_echo(db.connection(), session_id).await
    }

    /// Fail when a transferred record changed after the snapshot
    pub async fn validate_no_race(&self, session_id: &str) -> Result<()> {
        let db = self.store.lock().await;
        let conn = db.connection();
        let session = LibSqlSessionRepository::new(conn).require(session_id).await?;
        reconcile::validate_no_race(conn, self.store.schema(), &session).await
    }

    /// Apply the pushed records in one transaction.
    ///
    /// Validates against racing writes, allocates one tick, writes every
    /// record in dependency order to its table and the lookup index, and
    /// remembers the tick so this facility's next pull skips its own changes.
    /// Change events go out only after commit.
    pub async fn apply_push(&self, session_id: &str) -> Result<PushOutcome> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let repo = LibSqlSessionRepository::new(conn);
            let session = repo.require(session_id).await?;
            if session.status != SessionStatus::Validating {
                return Err(Error::InvalidTransition {
                    session_id: session.id,
                    from: session.status,
                    to: SessionStatus::Completed,
                });
            }
            reconcile::validate_no_race(conn, self.store.schema(), &session).await?;

            let incoming = dedupe_latest(
                repo.load_records(session_id, Direction::Incoming, 0, None)
                    .await?,
            );
            if incoming.is_empty() {
                return Ok((PushOutcome::default(), Vec::new()));
            }

            let tick = Clock::new(conn).allocate_tick().await?;
            let events = RecordStore::new(conn, self.store.schema(), self.store.graph())
                .write_ordered(&incoming, tick)
                .await
                .map_err(as_apply_failure)?;
            let index = LookupIndex::new(conn, self.store.schema(), self.store.graph());
            for record in &incoming {
                index.upsert_record(record, tick).await?;
            }
            repo.record_pushed_tick(tick, &session.facility_id, now_millis())
                .await?;

            Ok((
                PushOutcome {
                    tick: Some(tick),
                    applied: incoming.len(),
                    echoes_removed: 0,
                },
                events,
            ))
        }
        .await;
        let (outcome, events): (PushOutcome, Vec<ChangeEvent>) =
            finish_transaction(conn, result).await?;
        drop(db);

        if let Some(tick) = outcome.tick {
            tracing::info!(session_id, tick, applied = outcome.applied, "Applied push");
        }
        self.store.publish(events);
        Ok(outcome)
    }

    /// Finish the push phase: echo removal, race check, apply and complete.
    ///
    /// Any failure marks the session errored.
    pub async fn complete_push(&self, session_id: &str) -> Result<PushOutcome> {
        let result = async {
            {
                let db = self.store.lock().await;
                let repo = LibSqlSessionRepository::new(db.connection());
                let session = repo.require(session_id).await?;
                repo.transition(&session, SessionStatus::Validating).await?;
            }
            let echoes_removed = self.reconcile_echo(session_id).await?;
            let mut outcome = self.apply_push(session_id).await?;
            outcome.echoes_removed = echoes_removed;
            self.complete(session_id).await?;
            Ok(outcome)
        }
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error @ Error::InvalidTransition { .. }) => Err(error),
            Err(error) => Err(self.fail_with(session_id, error).await),
        }
    }

    /// Mark the session completed and advance the facility's high-water mark
    pub async fn complete(&self, session_id: &str) -> Result<SyncSession> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let repo = LibSqlSessionRepository::new(conn);
            let session = repo.require(session_id).await?;
            repo.transition(&session, SessionStatus::Completed).await?;

            let now = now_millis();
            repo.mark_completed(session_id, now).await?;
            if let Some(pull_until_tick) = session.pull_until_tick {
                repo.advance_high_water(&session.facility_id, pull_until_tick, now)
                    .await?;
                repo.forget_pushed_ticks(&session.facility_id, pull_until_tick)
                    .await?;
            }
            repo.purge_records(session_id).await?;
            repo.require(session_id).await
        }
        .await;
        let session = finish_transaction(conn, result).await?;
        tracing::info!(
            session_id,
            facility_id = %session.facility_id,
            pull_until_tick = ?session.pull_until_tick,
            "Completed sync session"
        );
        Ok(session)
    }

    /// Mark the session errored. The facility's high-water mark is left
    /// alone so the next attempt re-pulls the same range. Failing a finished
    /// session is a no-op.
    pub async fn fail(&self, session_id: &str, error: &str) -> Result<()> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let repo = LibSqlSessionRepository::new(conn);
            let session = repo.require(session_id).await?;
            if session.status.is_terminal() {
                return Ok(false);
            }
            repo.mark_errored(session_id, error, now_millis()).await?;
            repo.purge_records(session_id).await?;
            Ok(true)
        }
        .await;
        if finish_transaction(conn, result).await? {
            tracing::info!(session_id, error, "Sync session failed");
        }
        Ok(())
    }

    /// Fail the session for `error` and hand the error back
    async fn fail_with(&self, session_id: &str, error: Error) -> Error {
        match &error {
            Error::RaceCondition { .. } | Error::Apply(_) => {
                tracing::warn!(session_id, %error, "Sync session rejected");
            }
            _ => tracing::error!(session_id, %error, "Sync session failed"),
        }
        if let Err(fail_error) = self.fail(session_id, &error.to_string()).await {
            tracing::error!(session_id, error = %fail_error, "Could not mark session errored");
        }
        error
    }

    /// Session row plus transferred record counts
    pub async fn status(&self, session_id: &str) -> Result<SessionReport> {
        let db = self.store.lock().await;
        let repo = LibSqlSessionRepository::new(db.connection());
        let session = repo.require(session_id).await?;
        if !session.status.is_terminal() {
            repo.touch(session_id, now_millis()).await?;
        }
        Ok(SessionReport {
            outgoing_records: repo.count_records(session_id, Direction::Outgoing).await?,
            incoming_records: repo.count_records(session_id, Direction::Incoming).await?,
            session,
        })
    }

    /// Fail every open session idle for longer than the session timeout.
    /// Also drops pushed-tick markers past their retention. Returns the ids
    /// failed.
    pub async fn sweep_stale_sessions(&self, now: i64) -> Result<Vec<String>> {
        let cutoff = now - duration_millis(self.settings.session_timeout);
        let retention_cutoff = now - duration_millis(self.settings.pushed_tick_retention);
        let stale = {
            let db = self.store.lock().await;
            let repo = LibSqlSessionRepository::new(db.connection());
            let pruned = repo.prune_pushed_ticks(retention_cutoff).await?;
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned old pushed-tick markers");
            }
            repo.stale_sessions(cutoff).await?
        };
        for session_id in &stale {
            self.fail(session_id, "session timed out").await?;
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Failed stale sync sessions");
        }
        Ok(stale)
    }

    /// Sessions not yet completed or errored
    pub async fn active_session_count(&self) -> Result<u64> {
        let db = self.store.lock().await;
        LibSqlSessionRepository::new(db.connection())
            .count_active()
            .await
    }

    /// Evict stale queue entries and promote waiting devices
    pub async fn sweep_admission(&self, now: i64) -> Result<SweepSummary> {
        let db = self.store.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = self.admission_queue(conn).sweep(now).await;
        finish_transaction(conn, result).await
    }

    /// 1-based queue position of a device, if it is waiting
    pub async fn queue_position(&self, device_id: &str) -> Result<Option<usize>> {
        let db = self.store.lock().await;
        self.admission_queue(db.connection())
            .position(device_id)
            .await
    }

    fn admission_queue<'a>(&self, conn: &'a libsql::Connection) -> AdmissionQueue<'a> {
        AdmissionQueue::new(
            conn,
            self.settings.max_concurrent_sessions,
            self.settings.queue_claim_timeout,
        )
    }

    fn sort_order(&self, record_type: &str) -> i64 {
        self.store
            .graph()
            .rank(record_type)
            .and_then(|rank| i64::try_from(rank).ok())
            .unwrap_or(i64::MAX)
    }
}

/// Keep the last pushed copy of each record, at the position of its first copy
fn dedupe_latest(records: Vec<SyncableRecord>) -> Vec<SyncableRecord> {
    let mut positions: HashMap<(String, String), usize> = HashMap::with_capacity(records.len());
    let mut latest: Vec<SyncableRecord> = Vec::with_capacity(records.len());
    for record in records {
        let key = (record.record_type.clone(), record.record_id.clone());
        match positions.entry(key) {
            Entry::Occupied(slot) => latest[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests;
