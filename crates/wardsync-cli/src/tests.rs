use std::path::PathBuf;

use pretty_assertions::assert_eq;
use serde_json::json;
use wardsync_core::db::FactKey;

use crate::commands::common::{
    format_elapsed, format_record_lines, format_sync_timestamp, normalize_record_type, open_store,
    parse_payload,
};
use crate::commands::record::{run_record_add, run_record_delete, NewRecord};
use crate::commands::status::load_status;
use crate::commands::sync::{resolve_facility_id, run_sync, SyncOptions};
use crate::error::CliError;

fn temp_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("facility.db");
    (dir, path)
}

#[test]
fn parse_payload_requires_object() {
    assert_eq!(
        parse_payload(r#" {"name": "Ada"} "#).unwrap(),
        json!({"name": "Ada"})
    );
    assert!(matches!(parse_payload("[1, 2]"), Err(CliError::InvalidPayload(_))));
    assert!(matches!(parse_payload("{oops"), Err(CliError::InvalidPayload(_))));
}

#[test]
fn record_type_is_trimmed() {
    assert_eq!(normalize_record_type(" Patient ").unwrap(), "Patient");
    assert!(matches!(
        normalize_record_type("  "),
        Err(CliError::EmptyRecordType)
    ));
}

#[test]
fn elapsed_time_is_humanized() {
    assert_eq!(format_elapsed(-5), "just now");
    assert_eq!(format_elapsed(59_000), "just now");
    assert_eq!(format_elapsed(120_000), "2m ago");
    assert_eq!(format_elapsed(7_200_000), "2h ago");
    assert_eq!(format_elapsed(172_800_000), "2d ago");
}

#[test]
fn sync_timestamp_is_utc() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
    assert_eq!(
        format_sync_timestamp(1_700_000_000_000),
        "2023-11-14 22:13:20 UTC"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn record_add_then_delete() {
    let (_dir, db_path) = temp_db();

    let written = run_record_add(
        NewRecord {
            record_type: "Patient",
            data: r#"{"name": "Ada"}"#,
            id: Some("p1"),
            patient: Some("p1"),
            facility: None,
        },
        &db_path,
    )
    .await
    .unwrap();
    assert_eq!(written.record_id, "p1");
    assert_eq!(written.updated_at_tick, 1);
    assert_eq!(written.patient_id.as_deref(), Some("p1"));

    let lines = format_record_lines(&written);
    assert_eq!(lines[0], "Patient:p1  tick 1");
    assert_eq!(lines[1], "  patient:  p1");

    let deleted = run_record_delete("Patient", "p1", &db_path).await.unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.updated_at_tick, 2);

    let missing = run_record_delete("Patient", "p404", &db_path).await;
    assert!(matches!(
        missing,
        Err(CliError::Core(wardsync_core::Error::NotFound(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn facility_id_is_remembered() {
    let (_dir, db_path) = temp_db();
    let store = open_store(&db_path).await.unwrap();

    assert!(matches!(
        resolve_facility_id(&store, None).await,
        Err(CliError::FacilityNotConfigured)
    ));
    assert_eq!(
        resolve_facility_id(&store, Some(" fac-a ".to_string()))
            .await
            .unwrap(),
        "fac-a"
    );
    assert_eq!(resolve_facility_id(&store, None).await.unwrap(), "fac-a");
    assert_eq!(
        store.fact(FactKey::FacilityId).await.unwrap().as_deref(),
        Some("fac-a")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_rejects_invalid_central_url() {
    let (_dir, db_path) = temp_db();
    let result = run_sync(
        SyncOptions {
            central_url: "central.example.org".to_string(),
            facility_id: Some("fac-a".to_string()),
            device_id: None,
            follow: Vec::new(),
            urgent: false,
            page_size: 100,
        },
        &db_path,
    )
    .await;
    assert!(matches!(
        result,
        Err(CliError::Core(wardsync_core::Error::InvalidInput(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_unsynced_facility() {
    let (_dir, db_path) = temp_db();
    run_record_add(
        NewRecord {
            record_type: "Facility",
            data: "{}",
            id: Some("fac-a"),
            patient: None,
            facility: None,
        },
        &db_path,
    )
    .await
    .unwrap();

    let status = load_status(&db_path).await.unwrap();
    assert_eq!(status.facility_id, None);
    assert_eq!(status.current_tick, 1);
    assert_eq!(status.unpushed_ticks, 1);
    assert_eq!(status.last_sync_time, None);
    assert_eq!(status.last_sync, "never");
}
