//! Sync lookup index.
//!
//! One `sync_lookup` row per syncable record, denormalized from the record
//! tables so that "what changed since tick N for this facility" is a single
//! indexed scan. Rebuilds are upserts and can be re-run at any time.

mod cascade;

pub use cascade::CascadeSubscriber;

use std::collections::HashSet;

use libsql::params::Params;
use libsql::{Connection, Value};

use crate::clock::Clock;
use crate::db::{optional_text, query_i64, FactKey, LibSqlFactRepository};
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::models::{SessionParameters, SyncLookupEntry, SyncTick, SyncableRecord};
use crate::schema::SyncSchema;

/// Which scoped records a facility may receive.
///
/// Records with neither a patient nor a facility scope are global and always
/// visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visibility {
    pub all_patients: bool,
    pub patient_ids: Vec<String>,
    pub facility_ids: Vec<String>,
}

impl Visibility {
    /// Visibility for a facility session
    pub fn for_facility(facility_id: &str, parameters: &SessionParameters) -> Self {
        Self {
            all_patients: parameters.sync_all_patients,
            patient_ids: parameters.patient_ids.clone(),
            facility_ids: vec![facility_id.to_string()],
        }
    }

    /// Same rule as the `query_changes_since` filter, for one entry
    pub fn admits(&self, entry: &SyncLookupEntry) -> bool {
        match (entry.patient_id.as_deref(), entry.facility_id.as_deref()) {
            (None, None) => true,
            (patient_id, facility_id) => {
                patient_id.is_some_and(|patient_id| {
                    self.all_patients || self.patient_ids.iter().any(|id| id == patient_id)
                }) || facility_id
                    .is_some_and(|facility_id| self.facility_ids.iter().any(|id| id == facility_id))
            }
        }
    }
}

/// Result of a lookup rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Entries inserted or refreshed from record tables
    pub upserted: u64,
    /// Touched entries given a real tick
    pub touched_resolved: u64,
    /// New value of `syncLookupUpToTick`
    pub up_to_tick: i64,
}

/// Lookup index operations on one connection
pub struct LookupIndex<'a> {
    conn: &'a Connection,
    schema: &'a SyncSchema,
    graph: &'a DependencyGraph,
}

impl<'a> LookupIndex<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a SyncSchema, graph: &'a DependencyGraph) -> Self {
        Self {
            conn,
            schema,
            graph,
        }
    }

    /// Fold rows changed after `since` (every row when `None`) into the index.
    ///
    /// Touched entries are re-stamped with one freshly allocated tick, then
    /// the index high-water advances to the current tick. Runs inside the
    /// caller's transaction.
    pub async fn rebuild_since(&self, since: Option<i64>) -> Result<RebuildSummary> {
        let since = since.unwrap_or(i64::MIN);
        let mut upserted = 0;

        for model in self.schema.models() {
            upserted += self
                .conn
                .execute(
                    &format!(
                        "INSERT INTO sync_lookup
                            (record_type, record_id, patient_id, facility_id, is_deleted, updated_at_tick, data)
                         SELECT ?1, id, sync_patient_id, sync_facility_id, is_deleted, updated_at_tick, data
                         FROM {} WHERE updated_at_tick > ?2
                         ON CONFLICT(record_type, record_id) DO UPDATE SET
                            patient_id = excluded.patient_id,
                            facility_id = excluded.facility_id,
                            is_deleted = excluded.is_deleted,
                            updated_at_tick = excluded.updated_at_tick,
                            data = excluded.data",
                        model.table
                    ),
                    libsql::params![model.name.as_str(), since],
                )
                .await?;
        }

        let touched = query_i64(
            self.conn,
            "SELECT COUNT(*) FROM sync_lookup WHERE updated_at_tick = ?1",
            [SyncTick::TOUCHED],
        )
        .await?
        .unwrap_or(0);

        let clock = Clock::new(self.conn);
        let mut touched_resolved = 0;
        if touched > 0 {
            let tick = clock.allocate_tick().await?;
            touched_resolved = self
                .conn
                .execute(
                    "UPDATE sync_lookup SET updated_at_tick = ?1 WHERE updated_at_tick = ?2",
                    [tick, SyncTick::TOUCHED],
                )
                .await?;
        }

        let up_to_tick = clock.current_tick().await?;
        LibSqlFactRepository::new(self.conn)
            .set_i64(FactKey::SyncLookupUpToTick, up_to_tick)
            .await?;

        tracing::debug!(upserted, touched_resolved, up_to_tick, "Rebuilt sync lookup");
        Ok(RebuildSummary {
            upserted,
            touched_resolved,
            up_to_tick,
        })
    }

    /// Rebuild from the stored high-water
    pub async fn refresh(&self) -> Result<RebuildSummary> {
        let since = self.up_to_tick().await?;
        self.rebuild_since(Some(since)).await
    }

    /// Highest tick already folded into the index
    pub async fn up_to_tick(&self) -> Result<i64> {
        Ok(LibSqlFactRepository::new(self.conn)
            .get_i64(FactKey::SyncLookupUpToTick)
            .await?
            .unwrap_or(-1))
    }

    /// Mark every record depending on `record_type:record_id` as changed.
    ///
    /// Walks dependents recursively; only lookup entries are stamped, the
    /// dependents' own rows stay as they are. Touching twice is harmless.
    /// Returns the number of entries stamped.
    pub async fn cascade_touch(&self, record_type: &str, record_id: &str) -> Result<u64> {
        let mut visited = HashSet::from([(record_type.to_string(), record_id.to_string())]);
        let mut pending = vec![(record_type.to_string(), record_id.to_string())];
        let mut touched = 0;

        while let Some((parent_type, parent_id)) = pending.pop() {
            for dependent in self.graph.dependents_of(&parent_type) {
                let mut rows = self
                    .conn
                    .query(
                        &format!(
                            "SELECT id FROM {} WHERE json_extract(data, '$.{}') = ?1",
                            dependent.table, dependent.column
                        ),
                        [parent_id.as_str()],
                    )
                    .await?;

                let mut children = Vec::new();
                while let Some(row) = rows.next().await? {
                    children.push(row.get::<String>(0)?);
                }

                for child_id in children {
                    let key = (dependent.record_type.clone(), child_id);
                    if !visited.insert(key.clone()) {
                        continue;
                    }
                    touched += self
                        .conn
                        .execute(
                            "UPDATE sync_lookup SET updated_at_tick = ?1
                             WHERE record_type = ?2 AND record_id = ?3",
                            Params::Positional(vec![
                                Value::Integer(SyncTick::TOUCHED),
                                Value::Text(key.0.clone()),
                                Value::Text(key.1.clone()),
                            ]),
                        )
                        .await?;
                    pending.push(key);
                }
            }
        }

        if touched > 0 {
            tracing::debug!(record_type, record_id, touched, "Cascade touched dependents");
        }
        Ok(touched)
    }

    /// Touch the dependents of every row changed after `tick`.
    ///
    /// Used to catch up when change notifications were missed.
    pub async fn touch_dependents_changed_since(&self, tick: i64) -> Result<u64> {
        let mut touched = 0;
        for model in self.schema.models() {
            if self.graph.dependents_of(&model.name).is_empty() {
                continue;
            }
            let mut rows = self
                .conn
                .query(
                    &format!("SELECT id FROM {} WHERE updated_at_tick > ?1", model.table),
                    [tick],
                )
                .await?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().await? {
                ids.push(row.get::<String>(0)?);
            }
            for id in ids {
                touched += self.cascade_touch(&model.name, &id).await?;
            }
        }
        Ok(touched)
    }

    /// Entries with `after < updated_at_tick <= until` visible under
    /// `visibility`, ordered by dependency rank then record id. Tombstones are
    /// included.
    pub async fn query_changes_since(
        &self,
        after: i64,
        until: i64,
        visibility: &Visibility,
    ) -> Result<Vec<SyncLookupEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_type, record_id, patient_id, facility_id, is_deleted, updated_at_tick, data
                 FROM sync_lookup
                 WHERE updated_at_tick > ?1 AND updated_at_tick <= ?2
                   AND ((patient_id IS NULL AND facility_id IS NULL)
                     OR (patient_id IS NOT NULL
                         AND (?3 = 1 OR patient_id IN (SELECT value FROM json_each(?4))))
                     OR (facility_id IS NOT NULL
                         AND facility_id IN (SELECT value FROM json_each(?5))))",
                Params::Positional(vec![
                    Value::Integer(after),
                    Value::Integer(until),
                    Value::Integer(i64::from(visibility.all_patients)),
                    Value::Text(serde_json::to_string(&visibility.patient_ids)?),
                    Value::Text(serde_json::to_string(&visibility.facility_ids)?),
                ]),
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        self.sort_for_transfer(&mut entries);
        Ok(entries)
    }

    /// Add the current entry of every record that `entries` reference through
    /// a foreign key but `visibility` hides, transitively.
    ///
    /// Visible parents are left out: they reached the facility in an earlier
    /// range or are already in `entries`. The result is in transfer order.
    pub async fn with_hidden_parents(
        &self,
        mut entries: Vec<SyncLookupEntry>,
        visibility: &Visibility,
    ) -> Result<Vec<SyncLookupEntry>> {
        let mut seen: HashSet<(String, String)> = entries
            .iter()
            .map(|entry| (entry.record_type.clone(), entry.record_id.clone()))
            .collect();
        let mut pending: Vec<usize> = (0..entries.len()).collect();
        let mut added = 0_usize;

        while let Some(index) = pending.pop() {
            let model = self.schema.model(&entries[index].record_type)?;
            if model.foreign_keys.is_empty() {
                continue;
            }
            let data: serde_json::Value = serde_json::from_str(&entries[index].data)?;
            for fk in &model.foreign_keys {
                let Some(parent_id) = data.get(&fk.column).and_then(serde_json::Value::as_str)
                else {
                    continue;
                };
                if !seen.insert((fk.references.clone(), parent_id.to_string())) {
                    continue;
                }
                let Some(parent) = self.get(&fk.references, parent_id).await? else {
                    continue;
                };
                if visibility.admits(&parent) {
                    continue;
                }
                pending.push(entries.len());
                entries.push(parent);
                added += 1;
            }
        }

        if added > 0 {
            tracing::debug!(added, "Added hidden parents to transfer");
            self.sort_for_transfer(&mut entries);
        }
        Ok(entries)
    }

    fn sort_for_transfer(&self, entries: &mut [SyncLookupEntry]) {
        entries.sort_by(|a, b| {
            let rank_a = self.graph.rank(&a.record_type).unwrap_or(usize::MAX);
            let rank_b = self.graph.rank(&b.record_type).unwrap_or(usize::MAX);
            rank_a
                .cmp(&rank_b)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
    }

    /// Write one record's entry directly, as push application does
    pub async fn upsert_record(&self, record: &SyncableRecord, tick: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_lookup
                    (record_type, record_id, patient_id, facility_id, is_deleted, updated_at_tick, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(record_type, record_id) DO UPDATE SET
                    patient_id = excluded.patient_id,
                    facility_id = excluded.facility_id,
                    is_deleted = excluded.is_deleted,
                    updated_at_tick = excluded.updated_at_tick,
                    data = excluded.data",
                Params::Positional(vec![
                    Value::Text(record.record_type.clone()),
                    Value::Text(record.record_id.clone()),
                    optional_text(record.patient_id.as_deref()),
                    optional_text(record.facility_id.as_deref()),
                    Value::Integer(i64::from(record.is_deleted)),
                    Value::Integer(tick),
                    Value::Text(serde_json::to_string(&record.data)?),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Fetch one entry
    pub async fn get(&self, record_type: &str, record_id: &str) -> Result<Option<SyncLookupEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_type, record_id, patient_id, facility_id, is_deleted, updated_at_tick, data
                 FROM sync_lookup WHERE record_type = ?1 AND record_id = ?2",
                [record_type, record_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    fn parse_entry(row: &libsql::Row) -> Result<SyncLookupEntry> {
        Ok(SyncLookupEntry {
            record_type: row.get::<String>(0)?,
            record_id: row.get::<String>(1)?,
            patient_id: row.get::<Option<String>>(2)?,
            facility_id: row.get::<Option<String>>(3)?,
            is_deleted: row.get::<i64>(4)? != 0,
            updated_at_tick: row.get::<i64>(5)?,
            data: row.get::<String>(6)?,
        })
    }
}
