//! Logical clock backed by the `currentSyncTick` fact row.
//!
//! The increment is a single `UPDATE ... RETURNING` statement, so it is atomic
//! on its own; callers that combine it with other writes wrap it in their
//! immediate transaction instead of opening one here.

use libsql::Connection;

use crate::db::{query_i64, FactKey};
use crate::error::{Error, Result};
use crate::models::SyncTick;

/// Clock operations on one connection
pub struct Clock<'a> {
    conn: &'a Connection,
}

impl<'a> Clock<'a> {
    /// Create a clock over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Increment the clock and return the new tick.
    ///
    /// Call once per top-level write; every row of that write shares the tick.
    pub async fn allocate_tick(&self) -> Result<i64> {
        let tick = query_i64(
            self.conn,
            "INSERT INTO local_system_facts (key, value) VALUES (?1, '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1
             RETURNING CAST(value AS INTEGER)",
            [FactKey::CurrentSyncTick.as_str()],
        )
        .await?
        .ok_or_else(|| Error::Database("tick allocation returned no row".to_string()))?;

        tracing::trace!(tick, "Allocated sync tick");
        Ok(tick)
    }

    /// Read the clock without advancing it
    pub async fn current_tick(&self) -> Result<i64> {
        Ok(query_i64(
            self.conn,
            "SELECT CAST(value AS INTEGER) FROM local_system_facts WHERE key = ?1",
            [FactKey::CurrentSyncTick.as_str()],
        )
        .await?
        .unwrap_or(SyncTick::ORIGIN))
    }
}
