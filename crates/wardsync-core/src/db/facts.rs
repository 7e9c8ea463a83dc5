//! Durable key/value facts

use crate::error::Result;
use libsql::Connection;

/// Well-known fact keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKey {
    /// The logical clock
    CurrentSyncTick,
    /// Highest tick folded into the lookup index
    SyncLookupUpToTick,
    /// Facility: central tick up to which pulls have been applied
    LastSuccessfulSyncPull,
    /// Facility: local tick up to which changes have been pushed
    LastSuccessfulSyncPush,
    /// Facility: Unix ms of the last completed sync
    LastSuccessfulSyncTime,
    /// Facility: this server's facility id
    FacilityId,
}

impl FactKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CurrentSyncTick => "currentSyncTick",
            Self::SyncLookupUpToTick => "syncLookupUpToTick",
            Self::LastSuccessfulSyncPull => "lastSuccessfulSyncPull",
            Self::LastSuccessfulSyncPush => "lastSuccessfulSyncPush",
            Self::LastSuccessfulSyncTime => "lastSuccessfulSyncTime",
            Self::FacilityId => "facilityId",
        }
    }
}

/// libSQL access to `local_system_facts`
pub struct LibSqlFactRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlFactRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Read a fact as text
    pub async fn get(&self, key: FactKey) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM local_system_facts WHERE key = ?",
                [key.as_str()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get::<String>(0)?))
        } else {
            Ok(None)
        }
    }

    /// Read a numeric fact; absent or unparsable facts yield `None`
    pub async fn get_i64(&self, key: FactKey) -> Result<Option<i64>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|value| value.trim().parse().ok()))
    }

    /// Write a fact
    pub async fn set(&self, key: FactKey, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO local_system_facts (key, value) VALUES (?, ?)",
                [key.as_str(), value],
            )
            .await?;
        Ok(())
    }

    /// Write a numeric fact
    pub async fn set_i64(&self, key: FactKey, value: i64) -> Result<()> {
        self.set(key, &value.to_string()).await
    }
}
