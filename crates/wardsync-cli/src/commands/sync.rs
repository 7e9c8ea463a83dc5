use std::path::Path;

use wardsync_core::db::FactKey;
use wardsync_core::facility::{FacilityConfig, FacilitySync, HttpTransport, SyncReport};
use wardsync_core::util::normalize_text_option;
use wardsync_core::SyncStore;

use crate::commands::common::open_store;
use crate::error::CliError;

pub struct SyncOptions {
    pub central_url: String,
    pub facility_id: Option<String>,
    pub device_id: Option<String>,
    pub follow: Vec<String>,
    pub urgent: bool,
    pub page_size: u32,
}

pub async fn run_sync(options: SyncOptions, db_path: &Path) -> Result<SyncReport, CliError> {
    let store = open_store(db_path).await?;
    let facility_id = resolve_facility_id(&store, options.facility_id).await?;
    let device_id = normalize_text_option(options.device_id)
        .unwrap_or_else(|| format!("{facility_id}-cli"));

    let mut config = FacilityConfig::new(facility_id, device_id).with_page_size(options.page_size);
    config.urgent = options.urgent;
    if !options.follow.is_empty() {
        config = config.following(options.follow);
    }

    let transport = HttpTransport::new(options.central_url)?;
    let sync = FacilitySync::new(store, transport, config);
    let report = sync.run().await?;

    println!(
        "Sync completed: pulled {} ({} applied, {} kept local), pushed {}",
        report.pulled, report.applied, report.skipped, report.pushed
    );
    Ok(report)
}

/// The explicit id wins and is remembered; otherwise the remembered one is used
pub async fn resolve_facility_id(
    store: &SyncStore,
    explicit: Option<String>,
) -> Result<String, CliError> {
    if let Some(facility_id) = normalize_text_option(explicit) {
        store.set_fact(FactKey::FacilityId, &facility_id).await?;
        return Ok(facility_id);
    }
    normalize_text_option(store.fact(FactKey::FacilityId).await?)
        .ok_or(CliError::FacilityNotConfigured)
}
