//! Echo removal and race detection for pushed records.

use libsql::Connection;

use crate::error::{Error, Result};
use crate::models::{SyncTick, SyncSession};
use crate::schema::SyncSchema;

/// Remove incoming records that mirror what the session just sent out.
///
/// An incoming record is an echo when an outgoing record of the same session
/// has the same type, id, deletion flag and payload, and the incoming tick is
/// no older than the outgoing one or marks a peer-originated row. Returns the
/// number of records removed.
pub async fn reconcile_echo(conn: &Connection, session_id: &str) -> Result<u64> {
    let removed = conn
        .execute(
            "DELETE FROM session_sync_records
             WHERE session_id = ?1 AND direction = 'incoming'
               AND EXISTS (
                 SELECT 1 FROM session_sync_records AS outgoing
                 WHERE outgoing.session_id = ?1
                   AND outgoing.direction = 'outgoing'
                   AND outgoing.record_type = session_sync_records.record_type
                   AND outgoing.record_id = session_sync_records.record_id
                   AND outgoing.is_deleted = session_sync_records.is_deleted
                   AND outgoing.data = session_sync_records.data
                   AND (session_sync_records.updated_at_tick >= outgoing.updated_at_tick
                        OR session_sync_records.updated_at_tick = ?2)
               )",
            libsql::params![session_id, SyncTick::INCOMING_FROM_PEER],
        )
        .await?;

    if removed > 0 {
        tracing::debug!(session_id, removed, "Dropped echoed records from push");
    }
    Ok(removed)
}

/// Fail when any record pulled or pushed in the session has been written
/// after the session's snapshot tick.
///
/// Run inside the push transaction so nothing can land between the check and
/// the apply.
pub async fn validate_no_race(
    conn: &Connection,
    schema: &SyncSchema,
    session: &SyncSession,
) -> Result<()> {
    let pull_until_tick = session.pull_until_tick.ok_or_else(|| {
        Error::InvalidInput(format!("session {} has no snapshot", session.id))
    })?;

    let mut raced = Vec::new();
    for model in schema.models() {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT DISTINCT transferred.record_id, live.updated_at_tick
                     FROM session_sync_records AS transferred
                     JOIN {} AS live ON live.id = transferred.record_id
                     WHERE transferred.session_id = ?1
                       AND transferred.record_type = ?2
                       AND live.updated_at_tick > ?3
                     ORDER BY transferred.record_id",
                    model.table
                ),
                libsql::params![session.id.as_str(), model.name.as_str(), pull_until_tick],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let record_id = row.get::<String>(0)?;
            let tick = row.get::<i64>(1)?;
            tracing::debug!(
                session_id = %session.id,
                record_type = %model.name,
                record_id = %record_id,
                tick,
                pull_until_tick,
                "Record changed after snapshot"
            );
            raced.push(format!("{}:{record_id}", model.name));
        }
    }

    if raced.is_empty() {
        Ok(())
    } else {
        Err(Error::RaceCondition {
            session_id: session.id.clone(),
            pull_until_tick,
            records: raced,
        })
    }
}
