//! Device admission queue.
//!
//! Limits how many facility devices hold a sync session at once. A device
//! that cannot start immediately is queued; the periodic sweep promotes the
//! front of the queue to `ready` as capacity frees, and a ready device keeps
//! its slot until it claims it or the claim timeout evicts it.

use std::time::Duration;

use libsql::params::Params;
use libsql::{Connection, Value};

use crate::db::query_i64;
use crate::error::Result;
use crate::models::{QueueStatus, SyncQueuedDevice};
use crate::session::LibSqlSessionRepository;
use crate::util::duration_millis;

/// A device asking to start a sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub device_id: String,
    pub facility_id: String,
    pub urgent: bool,
    pub last_synced_tick: i64,
}

/// Answer to a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// 1-based place in line
    Queued { position: usize },
}

/// What a sweep changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub evicted: u64,
    pub promoted: u64,
}

const DEVICE_COLUMNS: &str = "device_id, facility_id, last_seen_time, last_synced_tick, urgent,
    status, enqueued_at, ready_at";

/// Queue operations on one connection
pub struct AdmissionQueue<'a> {
    conn: &'a Connection,
    capacity: u32,
    claim_timeout: Duration,
}

impl<'a> AdmissionQueue<'a> {
    pub const fn new(conn: &'a Connection, capacity: u32, claim_timeout: Duration) -> Self {
        Self {
            conn,
            capacity,
            claim_timeout,
        }
    }

    /// Gate for starting a session.
    ///
    /// A `ready` device claims its slot. Otherwise a device starts directly
    /// only when no other device is waiting and there is free capacity; every
    /// other request joins the queue.
    pub async fn admit(&self, request: &DeviceRequest, now: i64) -> Result<Admission> {
        if let Some(existing) = self.get(&request.device_id).await? {
            if existing.status == QueueStatus::Ready {
                self.remove(&request.device_id).await?;
                tracing::info!(device_id = %request.device_id, "Device claimed its sync slot");
                return Ok(Admission::Admitted);
            }
        }

        let others_waiting = query_i64(
            self.conn,
            "SELECT COUNT(*) FROM sync_queued_devices WHERE device_id != ?1",
            [request.device_id.as_str()],
        )
        .await?
        .unwrap_or(0);
        let active = LibSqlSessionRepository::new(self.conn).count_active().await?;

        if others_waiting == 0 && active < u64::from(self.capacity) {
            self.remove(&request.device_id).await?;
            return Ok(Admission::Admitted);
        }

        let position = self.enqueue(request, now).await?;
        tracing::debug!(
            device_id = %request.device_id,
            facility_id = %request.facility_id,
            position,
            active,
            "Device queued for sync"
        );
        Ok(Admission::Queued { position })
    }

    /// Add a device to the queue or refresh its entry. A device already in
    /// line keeps its place. Returns the device's position.
    pub async fn enqueue(&self, request: &DeviceRequest, now: i64) -> Result<usize> {
        self.conn
            .execute(
                "INSERT INTO sync_queued_devices
                    (device_id, facility_id, last_seen_time, last_synced_tick, urgent, status, enqueued_at, ready_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?3, NULL)
                 ON CONFLICT(device_id) DO UPDATE SET
                    facility_id = excluded.facility_id,
                    last_seen_time = excluded.last_seen_time,
                    last_synced_tick = excluded.last_synced_tick,
                    urgent = excluded.urgent",
                Params::Positional(vec![
                    Value::Text(request.device_id.clone()),
                    Value::Text(request.facility_id.clone()),
                    Value::Integer(now),
                    Value::Integer(request.last_synced_tick),
                    Value::Integer(i64::from(request.urgent)),
                ]),
            )
            .await?;

        Ok(self.position(&request.device_id).await?.unwrap_or(1))
    }

    /// Evict devices that went quiet, then promote the front of the queue
    /// while capacity remains. Safe to run any number of times.
    pub async fn sweep(&self, now: i64) -> Result<SweepSummary> {
        let cutoff = now - duration_millis(self.claim_timeout);
        let evicted_ready = self
            .conn
            .execute(
                "DELETE FROM sync_queued_devices WHERE status = 'ready' AND ready_at < ?1",
                [cutoff],
            )
            .await?;
        let evicted_queued = self
            .conn
            .execute(
                "DELETE FROM sync_queued_devices WHERE status = 'queued' AND last_seen_time < ?1",
                [cutoff],
            )
            .await?;

        let active = LibSqlSessionRepository::new(self.conn).count_active().await?;
        let ready = query_i64(
            self.conn,
            "SELECT COUNT(*) FROM sync_queued_devices WHERE status = 'ready'",
            (),
        )
        .await?
        .map_or(0, |count| u64::try_from(count).unwrap_or(0));
        let free = u64::from(self.capacity).saturating_sub(active + ready);

        let mut promoted = 0;
        if free > 0 {
            promoted = self
                .conn
                .execute(
                    "UPDATE sync_queued_devices SET status = 'ready', ready_at = ?1
                     WHERE device_id IN (
                        SELECT device_id FROM sync_queued_devices
                        WHERE status = 'queued'
                        ORDER BY urgent DESC, enqueued_at, device_id
                        LIMIT ?2
                     )",
                    libsql::params![now, i64::try_from(free).unwrap_or(i64::MAX)],
                )
                .await?;
        }

        let summary = SweepSummary {
            evicted: evicted_ready + evicted_queued,
            promoted,
        };
        if summary != SweepSummary::default() {
            tracing::info!(
                evicted = summary.evicted,
                promoted = summary.promoted,
                active,
                "Swept admission queue"
            );
        }
        Ok(summary)
    }

    /// 1-based position of a device; ready devices come first
    pub async fn position(&self, device_id: &str) -> Result<Option<usize>> {
        Ok(self
            .list()
            .await?
            .iter()
            .position(|device| device.device_id == device_id)
            .map(|index| index + 1))
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<SyncQueuedDevice>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DEVICE_COLUMNS} FROM sync_queued_devices WHERE device_id = ?1"),
                [device_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_device(&row)?)),
            None => Ok(None),
        }
    }

    /// Every queued or ready device in line order
    pub async fn list(&self) -> Result<Vec<SyncQueuedDevice>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM sync_queued_devices
                     ORDER BY status = 'ready' DESC, ready_at, urgent DESC, enqueued_at, device_id"
                ),
                (),
            )
            .await?;
        let mut devices = Vec::new();
        while let Some(row) = rows.next().await? {
            devices.push(Self::parse_device(&row)?);
        }
        Ok(devices)
    }

    async fn remove(&self, device_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_queued_devices WHERE device_id = ?1",
                [device_id],
            )
            .await?;
        Ok(())
    }

    fn parse_device(row: &libsql::Row) -> Result<SyncQueuedDevice> {
        Ok(SyncQueuedDevice {
            device_id: row.get::<String>(0)?,
            facility_id: row.get::<String>(1)?,
            last_seen_time: row.get::<i64>(2)?,
            last_synced_tick: row.get::<i64>(3)?,
            urgent: row.get::<i64>(4)? != 0,
            status: row.get::<String>(5)?.parse()?,
            enqueued_at: row.get::<i64>(6)?,
            ready_at: row.get::<Option<i64>>(7)?,
        })
    }
}
