use std::path::Path;

use wardsync_core::SyncableRecord;

use crate::commands::common::{
    format_record_lines, normalize_record_type, open_store, parse_payload, record_to_item,
};
use crate::error::CliError;

pub struct NewRecord<'a> {
    pub record_type: &'a str,
    pub data: &'a str,
    pub id: Option<&'a str>,
    pub patient: Option<&'a str>,
    pub facility: Option<&'a str>,
}

pub async fn run_record_add(new: NewRecord<'_>, db_path: &Path) -> Result<SyncableRecord, CliError> {
    let record_type = normalize_record_type(new.record_type)?;
    let data = parse_payload(new.data)?;

    let mut record = match new.id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => SyncableRecord::with_id(record_type, id, data),
        None => SyncableRecord::new(record_type, data),
    };
    if let Some(patient) = new.patient {
        record = record.for_patient(patient);
    }
    if let Some(facility) = new.facility {
        record = record.at_facility(facility);
    }

    let store = open_store(db_path).await?;
    let written = store.write(record).await?;
    println!("{} (tick {})", written.record_id, written.updated_at_tick);
    Ok(written)
}

pub async fn run_record_delete(
    record_type: &str,
    id: &str,
    db_path: &Path,
) -> Result<SyncableRecord, CliError> {
    let record_type = normalize_record_type(record_type)?;
    let store = open_store(db_path).await?;
    let deleted = store.soft_delete(&record_type, id.trim()).await?;
    println!("{}", deleted.record_id);
    Ok(deleted)
}

pub async fn run_record_show(
    record_type: &str,
    id: &str,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let record_type = normalize_record_type(record_type)?;
    let store = open_store(db_path).await?;
    let record = store
        .get_record(&record_type, id.trim())
        .await?
        .ok_or_else(|| CliError::RecordNotFound(format!("{record_type}:{}", id.trim())))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record_to_item(&record))?);
    } else {
        for line in format_record_lines(&record) {
            println!("{line}");
        }
    }
    Ok(())
}
