//! Generic clinical record store.
//!
//! Every record type gets its own table keyed by record id. The full payload
//! is kept as JSON in `data`; payload fields declared as foreign keys are also
//! copied into real `REFERENCES` columns so SQLite rejects a child written
//! before its parent.

use std::collections::BTreeSet;

use libsql::params::Params;
use libsql::{Connection, Value};
use serde_json::Value as JsonValue;

use crate::db::optional_text;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::models::{ChangeEvent, ChangeKind, SyncTick, SyncableRecord};
use crate::schema::{RecordModel, SyncSchema};

/// Outcome of applying a pulled batch on a facility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulledApply {
    pub applied: usize,
    /// Records left alone because the local row has an unpushed change
    pub skipped: usize,
}

struct StoredRow {
    updated_at_tick: i64,
    is_deleted: bool,
    data: JsonValue,
}

/// Record table access on one connection
pub struct RecordStore<'a> {
    conn: &'a Connection,
    schema: &'a SyncSchema,
    graph: &'a DependencyGraph,
}

impl<'a> RecordStore<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a SyncSchema, graph: &'a DependencyGraph) -> Self {
        Self {
            conn,
            schema,
            graph,
        }
    }

    /// Create one table per record type
    pub async fn create_tables(&self) -> Result<()> {
        for model in self.schema.models() {
            let mut columns = vec![
                "id TEXT PRIMARY KEY".to_string(),
                "updated_at_tick INTEGER NOT NULL".to_string(),
                "is_deleted INTEGER NOT NULL DEFAULT 0".to_string(),
                "sync_patient_id TEXT".to_string(),
                "sync_facility_id TEXT".to_string(),
                "data TEXT NOT NULL".to_string(),
            ];
            for fk in &model.foreign_keys {
                let target = self.schema.model(&fk.references)?;
                columns.push(format!(
                    "{} TEXT REFERENCES {}(id)",
                    fk.column, target.table
                ));
            }

            self.conn
                .execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {} ({})",
                        model.table,
                        columns.join(", ")
                    ),
                    (),
                )
                .await?;
            self.conn
                .execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_{table}_tick ON {table}(updated_at_tick)",
                        table = model.table
                    ),
                    (),
                )
                .await?;
        }
        Ok(())
    }

    /// Insert or overwrite one record, stamping it with `tick`.
    ///
    /// Foreign keys are written as given; a missing parent fails the
    /// constraint. Returns the change notification for the write.
    pub async fn upsert_with_tick(&self, record: &SyncableRecord, tick: i64) -> Result<ChangeEvent> {
        self.upsert_row(record, tick, false).await
    }

    /// Write a batch in dependency order with one shared tick.
    ///
    /// Records are sorted by type rank (input order within a type). Columns
    /// referencing the record's own type are first written as NULL and set in
    /// a second pass, so parent and child rows of the same type may arrive in
    /// any order.
    pub async fn write_ordered(
        &self,
        records: &[SyncableRecord],
        tick: i64,
    ) -> Result<Vec<ChangeEvent>> {
        let ordered = self.sort_by_rank(records);

        let mut events = Vec::with_capacity(ordered.len());
        for record in &ordered {
            events.push(self.upsert_row(record, tick, true).await?);
        }
        self.link_self_references(&ordered).await?;
        Ok(events)
    }

    /// Apply records pulled from central on a facility.
    ///
    /// Rows are stamped with [`SyncTick::INCOMING_FROM_PEER`] so they are never
    /// pushed back. A record whose local row changed after `last_pushed_tick`
    /// is skipped; the local change wins and goes out with the next push.
    pub async fn apply_pulled(
        &self,
        records: &[SyncableRecord],
        last_pushed_tick: i64,
    ) -> Result<PulledApply> {
        let ordered = self.sort_by_rank(records);

        let mut summary = PulledApply::default();
        let mut written = Vec::with_capacity(ordered.len());
        for record in ordered {
            let model = self.schema.model(&record.record_type)?;
            let pending = self
                .read_row(model, &record.record_id)
                .await?
                .is_some_and(|row| row.updated_at_tick > last_pushed_tick);
            if pending {
                tracing::debug!(
                    record = %record.label(),
                    "Keeping local change over pulled record"
                );
                summary.skipped += 1;
                continue;
            }

            self.upsert_row(&record, SyncTick::INCOMING_FROM_PEER, true)
                .await?;
            written.push(record);
            summary.applied += 1;
        }
        self.link_self_references(&written).await?;
        Ok(summary)
    }

    /// Fetch one record
    pub async fn get(&self, record_type: &str, record_id: &str) -> Result<Option<SyncableRecord>> {
        let model = self.schema.model(record_type)?;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, updated_at_tick, is_deleted, sync_patient_id, sync_facility_id, data
                     FROM {} WHERE id = ?1",
                    model.table
                ),
                [record_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&model.name, &row)?)),
            None => Ok(None),
        }
    }

    /// Tick currently stored on a record's row
    pub async fn tick_of(&self, record_type: &str, record_id: &str) -> Result<Option<i64>> {
        let model = self.schema.model(record_type)?;
        Ok(self
            .read_row(model, record_id)
            .await?
            .map(|row| row.updated_at_tick))
    }

    /// Records with `after < updated_at_tick <= until`, in dependency order
    pub async fn changed_since(&self, after: i64, until: i64) -> Result<Vec<SyncableRecord>> {
        let mut changed = Vec::new();
        for name in self.graph.topological_order()? {
            let model = self.schema.model(&name)?;
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT id, updated_at_tick, is_deleted, sync_patient_id, sync_facility_id, data
                         FROM {} WHERE updated_at_tick > ?1 AND updated_at_tick <= ?2
                         ORDER BY updated_at_tick, id",
                        model.table
                    ),
                    libsql::params![after, until],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                changed.push(Self::parse_record(&model.name, &row)?);
            }
        }
        Ok(changed)
    }

    fn sort_by_rank(&self, records: &[SyncableRecord]) -> Vec<SyncableRecord> {
        let mut ordered = records.to_vec();
        ordered.sort_by_key(|record| self.graph.rank(&record.record_type).unwrap_or(usize::MAX));
        ordered
    }

    async fn upsert_row(
        &self,
        record: &SyncableRecord,
        tick: i64,
        defer_self_references: bool,
    ) -> Result<ChangeEvent> {
        let model = self.schema.model(&record.record_type)?;
        let previous = self.read_row(model, &record.record_id).await?;
        let self_columns = self.graph.self_referential_columns(&model.name);

        let mut columns = vec![
            "id",
            "updated_at_tick",
            "is_deleted",
            "sync_patient_id",
            "sync_facility_id",
            "data",
        ];
        let mut values = vec![
            Value::Text(record.record_id.clone()),
            Value::Integer(tick),
            Value::Integer(i64::from(record.is_deleted)),
            optional_text(record.patient_id.as_deref()),
            optional_text(record.facility_id.as_deref()),
            Value::Text(serde_json::to_string(&record.data)?),
        ];
        for fk in &model.foreign_keys {
            columns.push(fk.column.as_str());
            let deferred = defer_self_references && self_columns.contains(&fk.column);
            values.push(if deferred {
                Value::Null
            } else {
                optional_text(record.field_str(&fk.column))
            });
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            model.table,
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );
        self.conn.execute(&sql, Params::Positional(values)).await?;

        Ok(Self::change_event(model, record, previous.as_ref()))
    }

    async fn link_self_references(&self, records: &[SyncableRecord]) -> Result<()> {
        for record in records {
            let self_columns = self.graph.self_referential_columns(&record.record_type);
            if self_columns.is_empty() {
                continue;
            }
            let model = self.schema.model(&record.record_type)?;
            for column in self_columns {
                self.conn
                    .execute(
                        &format!("UPDATE {} SET {column} = ?1 WHERE id = ?2", model.table),
                        Params::Positional(vec![
                            optional_text(record.field_str(column)),
                            Value::Text(record.record_id.clone()),
                        ]),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn read_row(&self, model: &RecordModel, record_id: &str) -> Result<Option<StoredRow>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT updated_at_tick, is_deleted, data FROM {} WHERE id = ?1",
                    model.table
                ),
                [record_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(StoredRow {
                updated_at_tick: row.get::<i64>(0)?,
                is_deleted: row.get::<i64>(1)? != 0,
                data: serde_json::from_str(&row.get::<String>(2)?)?,
            })),
            None => Ok(None),
        }
    }

    fn parse_record(record_type: &str, row: &libsql::Row) -> Result<SyncableRecord> {
        Ok(SyncableRecord {
            record_type: record_type.to_string(),
            record_id: row.get::<String>(0)?,
            updated_at_tick: row.get::<i64>(1)?,
            is_deleted: row.get::<i64>(2)? != 0,
            patient_id: row.get::<Option<String>>(3)?,
            facility_id: row.get::<Option<String>>(4)?,
            data: serde_json::from_str(&row.get::<String>(5)?)?,
        })
    }

    fn change_event(
        model: &RecordModel,
        record: &SyncableRecord,
        previous: Option<&StoredRow>,
    ) -> ChangeEvent {
        let id = Some(record.record_id.clone());
        match previous {
            None => ChangeEvent {
                table: model.table.clone(),
                event: ChangeKind::Insert,
                old_id: None,
                new_id: id,
                changed_columns: payload_fields(&record.data).into_iter().collect(),
            },
            Some(previous) => {
                let mut changed = changed_fields(&previous.data, &record.data);
                if previous.is_deleted != record.is_deleted {
                    changed.insert("is_deleted".to_string());
                }
                let event = if record.is_deleted && !previous.is_deleted {
                    ChangeKind::Delete
                } else {
                    ChangeKind::Update
                };
                ChangeEvent {
                    table: model.table.clone(),
                    event,
                    old_id: id.clone(),
                    new_id: if event == ChangeKind::Delete { None } else { id },
                    changed_columns: changed.into_iter().collect(),
                }
            }
        }
    }
}

/// Convert a write failure into an apply failure, keeping domain errors intact
pub(crate) fn as_apply_failure(error: Error) -> Error {
    match error {
        Error::LibSql(e) => Error::Apply(e.to_string()),
        Error::Database(message) => Error::Apply(message),
        other => other,
    }
}

fn payload_fields(data: &JsonValue) -> BTreeSet<String> {
    data.as_object()
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default()
}

fn changed_fields(old: &JsonValue, new: &JsonValue) -> BTreeSet<String> {
    match (old.as_object(), new.as_object()) {
        (Some(old), Some(new)) => old
            .keys()
            .chain(new.keys())
            .filter(|key| old.get(*key) != new.get(*key))
            .cloned()
            .collect(),
        _ if old == new => BTreeSet::new(),
        _ => BTreeSet::from(["data".to_string()]),
    }
}
