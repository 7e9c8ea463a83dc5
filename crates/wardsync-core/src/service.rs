//! Shared store wrapper used by the central server, the facility driver and
//! the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::db::{begin_immediate, finish_transaction, Database, FactKey, LibSqlFactRepository};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::lookup::{LookupIndex, RebuildSummary, Visibility};
use crate::models::{ChangeEvent, SyncLookupEntry, SyncableRecord};
use crate::records::RecordStore;
use crate::schema::SyncSchema;

/// Buffered change notifications before slow subscribers start lagging
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Thread-safe handle to one sync database and its record catalog.
///
/// All access goes through a single connection behind a mutex, which also
/// serializes tick allocation.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    schema: Arc<SyncSchema>,
    graph: Arc<DependencyGraph>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SyncStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>, schema: SyncSchema) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::open(&db_path).await?;
        Self::from_database(db, schema).await
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory(schema: SyncSchema) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Self::from_database(db, schema).await
    }

    async fn from_database(db: Database, schema: SyncSchema) -> Result<Self> {
        let graph = DependencyGraph::from_schema(&schema)?;
        let order = graph.topological_order()?;
        RecordStore::new(db.connection(), &schema, &graph)
            .create_tables()
            .await?;
        tracing::debug!(order = ?order, "Record tables ready");

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            schema: Arc::new(schema),
            graph: Arc::new(graph),
            changes,
        })
    }

    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Receive a notification for every committed record write
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Announce committed writes; having no subscribers is fine
    pub(crate) fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            let _ = self.changes.send(event);
        }
    }

    /// Write one record locally with a freshly allocated tick.
    pub async fn write(&self, record: SyncableRecord) -> Result<SyncableRecord> {
        let mut written = self.write_batch(vec![record]).await?;
        written
            .pop()
            .ok_or_else(|| Error::Database("write produced no record".to_string()))
    }

    /// Write several records as one logical change sharing a single tick.
    pub async fn write_batch(&self, records: Vec<SyncableRecord>) -> Result<Vec<SyncableRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in &records {
            self.schema.model(&record.record_type)?;
        }

        let db = self.db.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = async {
            let tick = Clock::new(conn).allocate_tick().await?;
            let events = RecordStore::new(conn, &self.schema, &self.graph)
                .write_ordered(&records, tick)
                .await?;
            Ok::<_, Error>((tick, events))
        }
        .await;
        let (tick, events) = finish_transaction(conn, result).await?;
        drop(db);

        tracing::debug!(tick, count = records.len(), "Wrote records");
        self.publish(events);
        Ok(records
            .into_iter()
            .map(|mut record| {
                record.updated_at_tick = tick;
                record
            })
            .collect())
    }

    /// Mark a record deleted; the row stays as a tombstone.
    pub async fn soft_delete(&self, record_type: &str, record_id: &str) -> Result<SyncableRecord> {
        let mut record = self
            .get_record(record_type, record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{record_type}:{record_id}")))?;
        record.is_deleted = true;
        self.write(record).await
    }

    /// Fetch a record by type and id
    pub async fn get_record(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Option<SyncableRecord>> {
        let db = self.db.lock().await;
        RecordStore::new(db.connection(), &self.schema, &self.graph)
            .get(record_type, record_id)
            .await
    }

    pub async fn current_tick(&self) -> Result<i64> {
        let db = self.db.lock().await;
        Clock::new(db.connection()).current_tick().await
    }

    pub async fn fact(&self, key: FactKey) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlFactRepository::new(db.connection()).get(key).await
    }

    pub async fn set_fact(&self, key: FactKey, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlFactRepository::new(db.connection())
            .set(key, value)
            .await
    }

    /// Fold rows changed since the last rebuild into the lookup index
    pub async fn refresh_lookup(&self) -> Result<RebuildSummary> {
        self.rebuild(false).await
    }

    /// Re-index every row
    pub async fn rebuild_lookup(&self) -> Result<RebuildSummary> {
        self.rebuild(true).await
    }

    async fn rebuild(&self, full: bool) -> Result<RebuildSummary> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let index = LookupIndex::new(conn, &self.schema, &self.graph);
        let result = if full {
            index.rebuild_since(None).await
        } else {
            index.refresh().await
        };
        finish_transaction(conn, result).await
    }

    /// Stamp every dependent of a record as changed
    pub async fn cascade_touch(&self, record_type: &str, record_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let result = LookupIndex::new(conn, &self.schema, &self.graph)
            .cascade_touch(record_type, record_id)
            .await;
        finish_transaction(conn, result).await
    }

    /// Touch dependents of every row not yet folded into the lookup index
    pub async fn retouch_recent_changes(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin_immediate(conn).await?;
        let index = LookupIndex::new(conn, &self.schema, &self.graph);
        let result = async {
            let since = index.up_to_tick().await?;
            index.touch_dependents_changed_since(since).await
        }
        .await;
        finish_transaction(conn, result).await
    }

    /// Fetch one lookup entry
    pub async fn lookup_entry(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Option<SyncLookupEntry>> {
        let db = self.db.lock().await;
        LookupIndex::new(db.connection(), &self.schema, &self.graph)
            .get(record_type, record_id)
            .await
    }

    /// Visible lookup entries changed in `(after, until]`
    pub async fn query_changes_since(
        &self,
        after: i64,
        until: i64,
        visibility: &Visibility,
    ) -> Result<Vec<SyncLookupEntry>> {
        let db = self.db.lock().await;
        LookupIndex::new(db.connection(), &self.schema, &self.graph)
            .query_changes_since(after, until, visibility)
            .await
    }
}
