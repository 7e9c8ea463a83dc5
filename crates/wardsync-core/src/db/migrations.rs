//! Database migrations

use crate::error::Result;
use libsql::Connection;

use super::{begin_immediate, finish_transaction};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn run_statements(conn: &Connection, statements: &[&str]) -> Result<()> {
    begin_immediate(conn).await?;
    let result = async {
        for stmt in statements {
            conn.execute(stmt, ()).await?;
        }
        Ok::<(), crate::Error>(())
    }
    .await;
    finish_transaction(conn, result).await
}

/// Migration to version 1: clock, lookup index and session tables
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Durable facts: the logical clock, lookup high-water and facility bookkeeping
        "CREATE TABLE IF NOT EXISTS local_system_facts (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT OR IGNORE INTO local_system_facts (key, value) VALUES ('currentSyncTick', '0')",
        "INSERT OR IGNORE INTO local_system_facts (key, value) VALUES ('syncLookupUpToTick', '-1')",
        "CREATE TABLE IF NOT EXISTS sync_lookup (
            record_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            patient_id TEXT,
            facility_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            updated_at_tick INTEGER NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (record_type, record_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_tick ON sync_lookup(updated_at_tick)",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_patient ON sync_lookup(patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_lookup_facility ON sync_lookup(facility_id)",
        "CREATE TABLE IF NOT EXISTS sync_sessions (
            id TEXT PRIMARY KEY,
            facility_id TEXT NOT NULL,
            status TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            last_connection_time INTEGER NOT NULL,
            pull_from_tick INTEGER NOT NULL,
            pull_until_tick INTEGER,
            snapshot_started_at INTEGER,
            snapshot_completed_at INTEGER,
            push_started_at INTEGER,
            completed_at INTEGER,
            error TEXT,
            parameters TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_sessions_status ON sync_sessions(status)",
        "CREATE TABLE IF NOT EXISTS session_sync_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sync_sessions(id) ON DELETE CASCADE,
            direction TEXT NOT NULL,
            record_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            patient_id TEXT,
            facility_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            updated_at_tick INTEGER NOT NULL,
            data TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_session_sync_records_order
            ON session_sync_records(session_id, direction, sort_order, record_id)",
        "CREATE INDEX IF NOT EXISTS idx_session_sync_records_record
            ON session_sync_records(session_id, record_type, record_id)",
        "CREATE TABLE IF NOT EXISTS facility_sync_state (
            facility_id TEXT PRIMARY KEY,
            last_pulled_tick INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        // Ticks allocated for a facility's push; excluded from that facility's next pull
        "CREATE TABLE IF NOT EXISTS sync_device_ticks (
            persisted_at_tick INTEGER PRIMARY KEY,
            facility_id TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_device_ticks_facility ON sync_device_ticks(facility_id)",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    run_statements(conn, &statements).await?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: device admission queue
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_queued_devices (
            device_id TEXT PRIMARY KEY,
            facility_id TEXT NOT NULL,
            last_seen_time INTEGER NOT NULL,
            last_synced_tick INTEGER NOT NULL,
            urgent INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            ready_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queued_devices_order
            ON sync_queued_devices(status, urgent DESC, enqueued_at)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    run_statements(conn, &statements).await?;
    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: age of pushed-tick markers, for pruning
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_device_ticks ADD COLUMN recorded_at INTEGER NOT NULL DEFAULT 0",
        "CREATE INDEX IF NOT EXISTS idx_sync_device_ticks_recorded ON sync_device_ticks(recorded_at)",
        "INSERT INTO schema_version (version) VALUES (3)",
    ];

    run_statements(conn, &statements).await?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
