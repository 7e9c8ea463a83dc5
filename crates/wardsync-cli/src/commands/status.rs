use std::path::Path;

use serde::Serialize;
use wardsync_core::db::FactKey;
use wardsync_core::util::now_millis;

use crate::commands::common::{format_elapsed, format_sync_timestamp, open_store};
use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusItem {
    pub facility_id: Option<String>,
    pub current_tick: i64,
    pub last_pull_tick: i64,
    pub unpushed_ticks: i64,
    pub last_sync_time: Option<i64>,
    pub last_sync: String,
}

pub async fn load_status(db_path: &Path) -> Result<StatusItem, CliError> {
    let store = open_store(db_path).await?;
    let now = now_millis();
    let current_tick = store.current_tick().await?;
    let facility_id = store.fact(FactKey::FacilityId).await?;

    let last_push = fact_i64(&store, FactKey::LastSuccessfulSyncPush).await?;
    let last_pull_tick = fact_i64(&store, FactKey::LastSuccessfulSyncPull).await?.unwrap_or(0);
    let last_sync_time = fact_i64(&store, FactKey::LastSuccessfulSyncTime).await?;

    Ok(StatusItem {
        facility_id,
        current_tick,
        last_pull_tick,
        unpushed_ticks: (current_tick - last_push.unwrap_or(0)).max(0),
        last_sync_time,
        last_sync: last_sync_time.map_or_else(
            || "never".to_string(),
            |time| format_elapsed(now - time),
        ),
    })
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let status = load_status(db_path).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Facility:      {}",
        status.facility_id.as_deref().unwrap_or("(not set)")
    );
    println!("Local tick:    {}", status.current_tick);
    println!("Unpushed:      {} ticks", status.unpushed_ticks);
    println!("Pulled up to:  {}", status.last_pull_tick);
    match status.last_sync_time {
        Some(time) => println!(
            "Last sync:     {} ({})",
            status.last_sync,
            format_sync_timestamp(time)
        ),
        None => println!("Last sync:     {}", status.last_sync),
    }
    Ok(())
}

async fn fact_i64(store: &wardsync_core::SyncStore, key: FactKey) -> Result<Option<i64>, CliError> {
    Ok(store
        .fact(key)
        .await?
        .and_then(|value| value.trim().parse::<i64>().ok()))
}
