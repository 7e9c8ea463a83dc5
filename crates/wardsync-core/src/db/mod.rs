//! Database layer for wardsync

mod connection;
mod facts;
mod migrations;

pub use connection::Database;
pub use facts::{FactKey, LibSqlFactRepository};

use libsql::Connection;

use crate::error::Result;

/// Open a write transaction that takes the database write lock up front.
pub(crate) async fn begin_immediate(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit when `result` is `Ok`, roll back otherwise.
pub(crate) async fn finish_transaction<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}

/// Bind an optional string as TEXT or NULL
pub(crate) fn optional_text(value: Option<&str>) -> libsql::Value {
    value.map_or(libsql::Value::Null, |text| {
        libsql::Value::Text(text.to_string())
    })
}

/// Read the first column of the first row as an integer.
pub(crate) async fn query_i64(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Option<i64>> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<i64>(0)?)),
        None => Ok(None),
    }
}
