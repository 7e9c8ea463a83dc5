//! Session persistence

use std::collections::HashSet;

use libsql::params::Params;
use libsql::{Connection, Value};

use crate::db::{optional_text, query_i64};
use crate::error::{Error, Result};
use crate::models::{
    Direction, SessionParameters, SessionStatus, SyncSession, SyncableRecord,
};

const SESSION_COLUMNS: &str = "id, facility_id, status, start_time, last_connection_time,
    pull_from_tick, pull_until_tick, snapshot_started_at, snapshot_completed_at,
    push_started_at, completed_at, error, parameters";

const RECORD_COLUMNS: &str =
    "record_type, record_id, patient_id, facility_id, is_deleted, updated_at_tick, data";

/// libSQL access to sessions, their transferred records and facility
/// high-water marks
pub struct LibSqlSessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSessionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn insert(&self, session: &SyncSession) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, NULL, NULL, NULL, ?7)"
                ),
                Params::Positional(vec![
                    Value::Text(session.id.clone()),
                    Value::Text(session.facility_id.clone()),
                    Value::Text(session.status.as_str().to_string()),
                    Value::Integer(session.start_time),
                    Value::Integer(session.last_connection_time),
                    Value::Integer(session.pull_from_tick),
                    Value::Text(serde_json::to_string(&session.parameters)?),
                ]),
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SyncSession>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?1"),
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_session(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetch a session or fail with `NotFound`
    pub async fn require(&self, id: &str) -> Result<SyncSession> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync session {id}")))
    }

    /// Move `session` to `next` if the state machine allows it
    pub async fn transition(&self, session: &SyncSession, next: SessionStatus) -> Result<()> {
        if !session.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                session_id: session.id.clone(),
                from: session.status,
                to: next,
            });
        }
        self.conn
            .execute(
                "UPDATE sync_sessions SET status = ?1 WHERE id = ?2",
                [next.as_str(), session.id.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Record that the facility is still talking to us
    pub async fn touch(&self, id: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_sessions SET last_connection_time = ?1 WHERE id = ?2",
                libsql::params![now, id],
            )
            .await?;
        Ok(())
    }

    /// Move a queued session to `snapshotting` if fewer than `max` sessions
    /// are snapshotting. Check and update are one statement.
    pub async fn try_claim_snapshot(&self, id: &str, max: u32, now: i64) -> Result<bool> {
        let claimed = self
            .conn
            .execute(
                "UPDATE sync_sessions
                 SET status = 'snapshotting', snapshot_started_at = ?2, last_connection_time = ?2
                 WHERE id = ?1 AND status = 'snapshot_queued'
                   AND (SELECT COUNT(*) FROM sync_sessions WHERE status = 'snapshotting') < ?3",
                libsql::params![id, now, i64::from(max)],
            )
            .await?;
        Ok(claimed == 1)
    }

    pub async fn mark_snapshot_ready(&self, id: &str, pull_until_tick: i64, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_sessions
                 SET status = 'snapshot_ready', pull_until_tick = ?2,
                     snapshot_completed_at = ?3, last_connection_time = ?3
                 WHERE id = ?1",
                libsql::params![id, pull_until_tick, now],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_pushing(&self, id: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_sessions
                 SET status = 'pushing', push_started_at = COALESCE(push_started_at, ?2),
                     last_connection_time = ?2
                 WHERE id = ?1",
                libsql::params![id, now],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_sessions
                 SET status = 'completed', completed_at = ?2, last_connection_time = ?2
                 WHERE id = ?1",
                libsql::params![id, now],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_errored(&self, id: &str, error: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_sessions
                 SET status = 'errored', error = ?2, completed_at = ?3
                 WHERE id = ?1",
                libsql::params![id, error, now],
            )
            .await?;
        Ok(())
    }

    /// Store records transferred in a session
    pub async fn insert_records(
        &self,
        id: &str,
        direction: Direction,
        records: &[(i64, SyncableRecord)],
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO session_sync_records (session_id, direction, sort_order, {RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        );
        for (sort_order, record) in records {
            self.conn
                .execute(
                    &sql,
                    Params::Positional(vec![
                        Value::Text(id.to_string()),
                        Value::Text(direction.as_str().to_string()),
                        Value::Integer(*sort_order),
                        Value::Text(record.record_type.clone()),
                        Value::Text(record.record_id.clone()),
                        optional_text(record.patient_id.as_deref()),
                        optional_text(record.facility_id.as_deref()),
                        Value::Integer(i64::from(record.is_deleted)),
                        Value::Integer(record.updated_at_tick),
                        Value::Text(serde_json::to_string(&record.data)?),
                    ]),
                )
                .await?;
        }
        Ok(())
    }

    /// Records of one direction in transfer order
    pub async fn load_records(
        &self,
        id: &str,
        direction: Direction,
        offset: u64,
        limit: Option<u32>,
    ) -> Result<Vec<SyncableRecord>> {
        let limit = limit.map_or(-1, i64::from);
        let offset = i64::try_from(offset)
            .map_err(|_| Error::InvalidInput(format!("offset {offset} is out of range")))?;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM session_sync_records
                     WHERE session_id = ?1 AND direction = ?2
                     ORDER BY sort_order, record_id, id
                     LIMIT ?3 OFFSET ?4"
                ),
                libsql::params![id, direction.as_str(), limit, offset],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(SyncableRecord {
                record_type: row.get::<String>(0)?,
                record_id: row.get::<String>(1)?,
                patient_id: row.get::<Option<String>>(2)?,
                facility_id: row.get::<Option<String>>(3)?,
                is_deleted: row.get::<i64>(4)? != 0,
                updated_at_tick: row.get::<i64>(5)?,
                data: serde_json::from_str(&row.get::<String>(6)?)?,
            });
        }
        Ok(records)
    }

    pub async fn count_records(&self, id: &str, direction: Direction) -> Result<u64> {
        let count = query_i64(
            self.conn,
            "SELECT COUNT(*) FROM session_sync_records WHERE session_id = ?1 AND direction = ?2",
            [id, direction.as_str()],
        )
        .await?
        .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn purge_records(&self, id: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM session_sync_records WHERE session_id = ?1", [id])
            .await?)
    }

    /// Last tick a facility pulled up to
    pub async fn facility_high_water(&self, facility_id: &str) -> Result<Option<i64>> {
        query_i64(
            self.conn,
            "SELECT last_pulled_tick FROM facility_sync_state WHERE facility_id = ?1",
            [facility_id],
        )
        .await
    }

    /// Raise a facility's high-water mark; never lowers it
    pub async fn advance_high_water(&self, facility_id: &str, tick: i64, now: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO facility_sync_state (facility_id, last_pulled_tick, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(facility_id) DO UPDATE SET
                    last_pulled_tick = MAX(last_pulled_tick, excluded.last_pulled_tick),
                    updated_at = excluded.updated_at",
                libsql::params![facility_id, tick, now],
            )
            .await?;
        Ok(())
    }

    /// Remember that `tick` carries a push from `facility_id`
    pub async fn record_pushed_tick(&self, tick: i64, facility_id: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_device_ticks (persisted_at_tick, facility_id, recorded_at)
                 VALUES (?1, ?2, ?3)",
                libsql::params![tick, facility_id, now],
            )
            .await?;
        Ok(())
    }

    /// Ticks in `(after, until]` that carry pushes from `facility_id`
    pub async fn pushed_ticks(
        &self,
        facility_id: &str,
        after: i64,
        until: i64,
    ) -> Result<HashSet<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT persisted_at_tick FROM sync_device_ticks
                 WHERE facility_id = ?1 AND persisted_at_tick > ?2 AND persisted_at_tick <= ?3",
                libsql::params![facility_id, after, until],
            )
            .await?;
        let mut ticks = HashSet::new();
        while let Some(row) = rows.next().await? {
            ticks.insert(row.get::<i64>(0)?);
        }
        Ok(ticks)
    }

    /// Drop pushed-tick markers of every facility recorded before `cutoff`
    pub async fn prune_pushed_ticks(&self, cutoff: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM sync_device_ticks WHERE recorded_at < ?1",
                [cutoff],
            )
            .await?)
    }

    /// Drop pushed-tick markers the facility has now pulled past
    pub async fn forget_pushed_ticks(&self, facility_id: &str, up_to: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM sync_device_ticks WHERE facility_id = ?1 AND persisted_at_tick <= ?2",
                libsql::params![facility_id, up_to],
            )
            .await?)
    }

    /// Sessions not yet completed or errored
    pub async fn count_active(&self) -> Result<u64> {
        let count = query_i64(
            self.conn,
            "SELECT COUNT(*) FROM sync_sessions WHERE status NOT IN ('completed', 'errored')",
            (),
        )
        .await?
        .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Non-terminal sessions idle since before `cutoff`
    pub async fn stale_sessions(&self, cutoff: i64) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM sync_sessions
                 WHERE status NOT IN ('completed', 'errored') AND last_connection_time < ?1
                 ORDER BY last_connection_time",
                [cutoff],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Non-terminal sessions of one facility, oldest first
    pub async fn open_sessions_for_facility(&self, facility_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM sync_sessions
                 WHERE facility_id = ?1 AND status NOT IN ('completed', 'errored')
                 ORDER BY start_time",
                [facility_id],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    fn parse_session(row: &libsql::Row) -> Result<SyncSession> {
        let parameters: SessionParameters = serde_json::from_str(&row.get::<String>(12)?)?;
        Ok(SyncSession {
            id: row.get::<String>(0)?,
            facility_id: row.get::<String>(1)?,
            status: row.get::<String>(2)?.parse()?,
            start_time: row.get::<i64>(3)?,
            last_connection_time: row.get::<i64>(4)?,
            pull_from_tick: row.get::<i64>(5)?,
            pull_until_tick: row.get::<Option<i64>>(6)?,
            snapshot_started_at: row.get::<Option<i64>>(7)?,
            snapshot_completed_at: row.get::<Option<i64>>(8)?,
            push_started_at: row.get::<Option<i64>>(9)?,
            completed_at: row.get::<Option<i64>>(10)?,
            error: row.get::<Option<String>>(11)?,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn session(id: &str, facility_id: &str, now: i64) -> SyncSession {
        SyncSession {
            id: id.to_string(),
            facility_id: facility_id.to_string(),
            status: SessionStatus::Created,
            start_time: now,
            last_connection_time: now,
            pull_from_tick: 0,
            pull_until_tick: None,
            snapshot_started_at: None,
            snapshot_completed_at: None,
            push_started_at: None,
            completed_at: None,
            error: None,
            parameters: SessionParameters::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());

        let mut created = session("s1", "f1", 100);
        created.parameters.patient_ids = vec!["p1".to_string()];
        repo.insert(&created).await.unwrap();

        let loaded = repo.require("s1").await.unwrap();
        assert_eq!(loaded, created);
        assert!(matches!(repo.require("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_illegal_transition_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        let created = session("s1", "f1", 100);
        repo.insert(&created).await.unwrap();

        let err = repo
            .transition(&created, SessionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            repo.require("s1").await.unwrap().status,
            SessionStatus::Created
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_claim_respects_ceiling() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        for id in ["s1", "s2"] {
            let created = session(id, "f1", 100);
            repo.insert(&created).await.unwrap();
            repo.transition(&created, SessionStatus::SnapshotQueued)
                .await
                .unwrap();
        }

        assert!(repo.try_claim_snapshot("s1", 1, 200).await.unwrap());
        assert!(!repo.try_claim_snapshot("s2", 1, 200).await.unwrap());
        // A claimed session cannot be claimed twice
        assert!(!repo.try_claim_snapshot("s1", 5, 200).await.unwrap());

        let claimed = repo.require("s1").await.unwrap();
        assert_eq!(claimed.status, SessionStatus::Snapshotting);
        assert_eq!(claimed.snapshot_started_at, Some(200));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_records_page_in_sort_order() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        repo.insert(&session("s1", "f1", 100)).await.unwrap();

        let records = vec![
            (3, SyncableRecord::with_id("Encounter", "e1", json!({}))),
            (2, SyncableRecord::with_id("Patient", "p2", json!({}))),
            (2, SyncableRecord::with_id("Patient", "p1", json!({}))),
        ];
        repo.insert_records("s1", Direction::Outgoing, &records)
            .await
            .unwrap();

        let first = repo
            .load_records("s1", Direction::Outgoing, 0, Some(2))
            .await
            .unwrap();
        let ids: Vec<&str> = first.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);

        let rest = repo
            .load_records("s1", Direction::Outgoing, 2, Some(2))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record_id, "e1");
        assert_eq!(
            repo.count_records("s1", Direction::Incoming).await.unwrap(),
            0
        );

        assert_eq!(repo.purge_records("s1").await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_high_water_never_decreases() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());

        assert_eq!(repo.facility_high_water("f1").await.unwrap(), None);
        repo.advance_high_water("f1", 10, 1).await.unwrap();
        repo.advance_high_water("f1", 7, 2).await.unwrap();
        assert_eq!(repo.facility_high_water("f1").await.unwrap(), Some(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_sessions_ignore_terminal_ones() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        repo.insert(&session("old", "f1", 100)).await.unwrap();
        repo.insert(&session("fresh", "f2", 900)).await.unwrap();
        repo.insert(&session("done", "f3", 100)).await.unwrap();
        repo.mark_errored("done", "boom", 100).await.unwrap();

        assert_eq!(repo.stale_sessions(500).await.unwrap(), vec!["old"]);
        assert_eq!(repo.count_active().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_sessions_are_listed_per_facility() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        repo.insert(&session("second", "f1", 200)).await.unwrap();
        repo.insert(&session("first", "f1", 100)).await.unwrap();
        repo.insert(&session("done", "f1", 50)).await.unwrap();
        repo.insert(&session("other", "f2", 100)).await.unwrap();
        repo.mark_errored("done", "boom", 60).await.unwrap();

        assert_eq!(
            repo.open_sessions_for_facility("f1").await.unwrap(),
            vec!["first", "second"]
        );
        assert!(repo.open_sessions_for_facility("f3").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_ticks_are_range_bounded_and_pruned_by_age() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSessionRepository::new(db.connection());
        repo.record_pushed_tick(3, "f1", 1_000).await.unwrap();
        repo.record_pushed_tick(8, "f1", 5_000).await.unwrap();
        repo.record_pushed_tick(9, "f2", 1_000).await.unwrap();

        let ticks = repo.pushed_ticks("f1", 0, 10).await.unwrap();
        assert_eq!(ticks, HashSet::from([3, 8]));
        assert_eq!(
            repo.pushed_ticks("f1", 3, 10).await.unwrap(),
            HashSet::from([8])
        );

        assert_eq!(repo.prune_pushed_ticks(2_000).await.unwrap(), 2);
        assert_eq!(
            repo.pushed_ticks("f1", 0, 10).await.unwrap(),
            HashSet::from([8])
        );
        assert!(repo.pushed_ticks("f2", 0, 10).await.unwrap().is_empty());
    }
}
