use std::collections::HashSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::schema::SyncSchema;

async fn manager(settings: SyncSettings) -> SessionManager {
    let store = SyncStore::open_in_memory(SyncSchema::clinical())
        .await
        .unwrap();
    SessionManager::new(store, settings)
}

fn request(facility_id: &str, device_id: &str) -> StartSyncRequest {
    StartSyncRequest {
        facility_id: facility_id.to_string(),
        device_id: device_id.to_string(),
        urgent: false,
        last_synced_tick: 0,
        is_mobile: false,
        sync_all_patients: true,
        patient_ids: Vec::new(),
    }
}

async fn start(manager: &SessionManager, facility_id: &str) -> SyncSession {
    match manager
        .start_session(&request(facility_id, &format!("{facility_id}-device")))
        .await
        .unwrap()
    {
        StartOutcome::Started(session) => session,
        StartOutcome::Queued { position } => panic!("queued at {position}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_session_drops_echoes_and_skips_own_pushes() {
    let manager = manager(SyncSettings::default()).await;
    manager
        .store()
        .write(SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada"})))
        .await
        .unwrap();

    let session = start(&manager, "f1").await;
    assert_eq!(session.pull_from_tick, 0);
    assert_eq!(session.status, SessionStatus::Created);

    let snapshot = manager.initiate_pull(&session.id).await.unwrap();
    assert_eq!(snapshot, SnapshotSummary { pull_until_tick: 1, total: 1 });

    let page = manager.transfer_to_facility(&session.id, 0, None).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert!(!page.has_more);
    let pulled = page.records[0].clone();
    assert_eq!(pulled.updated_at_tick, 1);

    let fresh = SyncableRecord::with_id("Patient", "p2", json!({"name": "Grace"}));
    let received = manager
        .receive_push(&session.id, vec![pulled, fresh])
        .await
        .unwrap();
    assert_eq!(received, 2);

    let outcome = manager.complete_push(&session.id).await.unwrap();
    assert_eq!(outcome.echoes_removed, 1);
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.tick, Some(2));

    let report = manager.status(&session.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.incoming_records, 0);
    assert_eq!(report.outgoing_records, 0);

    let p2 = manager.store().get_record("Patient", "p2").await.unwrap().unwrap();
    assert_eq!(p2.updated_at_tick, 2);

    // The next pull starts at the old high-water but leaves out p2
    let next = start(&manager, "f1").await;
    assert_eq!(next.pull_from_tick, 1);
    let snapshot = manager.initiate_pull(&next.id).await.unwrap();
    assert_eq!(snapshot.total, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pull_pages_follow_dependency_order() {
    let manager = manager(SyncSettings::default()).await;
    manager
        .store()
        .write_batch(vec![
            SyncableRecord::with_id("Encounter", "e1", json!({"patient_id": "p1"})),
            SyncableRecord::with_id("Patient", "p1", json!({})),
        ])
        .await
        .unwrap();

    let session = start(&manager, "f1").await;
    manager.initiate_pull(&session.id).await.unwrap();

    let first = manager
        .transfer_to_facility(&session.id, 0, Some(1))
        .await
        .unwrap();
    assert_eq!(first.records[0].record_type, "Patient");
    assert_eq!(first.next_offset, 1);
    assert!(first.has_more);

    let second = manager
        .transfer_to_facility(&session.id, first.next_offset, Some(1))
        .await
        .unwrap();
    assert_eq!(second.records[0].record_type, "Encounter");
    assert!(!second.has_more);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_race_rejects_push_without_partial_state() {
    let manager = manager(SyncSettings::default()).await;
    manager
        .store()
        .write(SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada"})))
        .await
        .unwrap();

    let session = start(&manager, "f1").await;
    manager.initiate_pull(&session.id).await.unwrap();

    // Central edit after the snapshot was frozen
    manager
        .store()
        .write(SyncableRecord::with_id("Patient", "p1", json!({"name": "Ada L."})))
        .await
        .unwrap();

    manager
        .receive_push(
            &session.id,
            vec![SyncableRecord::with_id("Patient", "p9", json!({}))],
        )
        .await
        .unwrap();

    let result = manager.complete_push(&session.id).await;
    match result {
        Err(Error::RaceCondition { records, pull_until_tick, .. }) => {
            assert_eq!(pull_until_tick, 1);
            assert_eq!(records, vec!["Patient:p1".to_string()]);
        }
        other => panic!("expected race, got {other:?}"),
    }

    assert!(manager.store().get_record("Patient", "p9").await.unwrap().is_none());
    assert_eq!(manager.store().current_tick().await.unwrap(), 2);

    let report = manager.status(&session.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::Errored);
    assert!(report.session.error.is_some());

    // The failed session leaves the high-water mark alone
    let retry = start(&manager, "f1").await;
    assert_eq!(retry.pull_from_tick, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_capacity_times_out_then_frees() {
    let settings = SyncSettings::default()
        .with_max_concurrent_snapshots(1)
        .with_snapshot_capacity_wait(
            Duration::from_millis(60),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
    let manager = manager(settings).await;

    let first = start(&manager, "f1").await;
    let second = start(&manager, "f2").await;

    manager.request_snapshot_capacity(&first.id).await.unwrap();
    let blocked = manager.request_snapshot_capacity(&second.id).await;
    assert!(matches!(
        blocked,
        Err(Error::CapacityTimeout { resource: "snapshot", .. })
    ));
    let report = manager.status(&second.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::SnapshotQueued);

    manager.build_snapshot(&first.id).await.unwrap();

    let snapshot = manager.initiate_pull(&second.id).await.unwrap();
    assert_eq!(snapshot.total, 0);
    let report = manager.status(&second.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::SnapshotReady);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initiate_pull_is_idempotent() {
    let manager = manager(SyncSettings::default()).await;
    manager
        .store()
        .write(SyncableRecord::with_id("Facility", "f1", json!({})))
        .await
        .unwrap();
    let session = start(&manager, "f1").await;

    let first = manager.initiate_pull(&session.id).await.unwrap();
    let again = manager.initiate_pull(&session.id).await.unwrap();
    assert_eq!(first, again);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_before_snapshot_is_rejected() {
    let manager = manager(SyncSettings::default()).await;
    let session = start(&manager, "f1").await;

    let result = manager
        .receive_push(
            &session.id,
            vec![SyncableRecord::with_id("Patient", "p1", json!({}))],
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition {
            from: SessionStatus::Created,
            to: SessionStatus::Pushing,
            ..
        })
    ));

    let unknown = manager
        .receive_push(
            &session.id,
            vec![SyncableRecord::with_id("Invoice", "i1", json!({}))],
        )
        .await;
    assert!(matches!(unknown, Err(Error::InvalidInput(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_push_completes_session() {
    let manager = manager(SyncSettings::default()).await;
    let session = start(&manager, "f1").await;
    manager.initiate_pull(&session.id).await.unwrap();

    let outcome = manager.complete_push(&session.id).await.unwrap();
    assert_eq!(outcome, PushOutcome::default());
    let report = manager.status(&session.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_sessions_are_failed_and_fail_is_idempotent() {
    let manager = manager(SyncSettings::default()).await;
    let session = start(&manager, "f1").await;
    assert_eq!(manager.active_session_count().await.unwrap(), 1);

    let far_future = now_millis() + 3_600_000;
    let failed = manager.sweep_stale_sessions(far_future).await.unwrap();
    assert_eq!(failed, vec![session.id.clone()]);
    assert_eq!(manager.active_session_count().await.unwrap(), 0);

    manager.fail(&session.id, "again").await.unwrap();
    let report = manager.status(&session.id).await.unwrap();
    assert_eq!(report.session.error.as_deref(), Some("session timed out"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_queues_devices_over_capacity() {
    let manager = manager(SyncSettings::default().with_max_concurrent_sessions(1)).await;
    start(&manager, "f1").await;

    let outcome = manager.start_session(&request("f2", "d2")).await.unwrap();
    assert_eq!(outcome, StartOutcome::Queued { position: 1 });
    assert_eq!(manager.queue_position("d2").await.unwrap(), Some(1));

    let missing = manager.start_session(&request("", "d3")).await;
    assert!(matches!(missing, Err(Error::InvalidInput(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_facility_keeps_one_open_session() {
    let manager = manager(SyncSettings::default().with_max_concurrent_sessions(2)).await;

    let mut sessions = Vec::new();
    for device in ["dev-1", "dev-2", "dev-1"] {
        match manager.start_session(&request("fac-a", device)).await.unwrap() {
            StartOutcome::Started(session) => sessions.push(session),
            StartOutcome::Queued { position } => panic!("{device} queued at {position}"),
        }
    }
    assert_eq!(manager.active_session_count().await.unwrap(), 1);

    for replaced in &sessions[..2] {
        let report = manager.status(&replaced.id).await.unwrap();
        assert_eq!(report.session.status, SessionStatus::Errored);
        assert_eq!(
            report.session.error.as_deref(),
            Some("superseded by a newer session")
        );
    }
    let latest = manager.status(&sessions[2].id).await.unwrap();
    assert_eq!(latest.session.status, SessionStatus::Created);

    // Another facility still gets the second slot
    start(&manager, "fac-b").await;
    assert_eq!(manager.active_session_count().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_superseded_session_cannot_push() {
    let manager = manager(SyncSettings::default()).await;
    let first = start(&manager, "f1").await;
    manager.initiate_pull(&first.id).await.unwrap();

    start(&manager, "f1").await;
    let result = manager
        .receive_push(
            &first.id,
            vec![SyncableRecord::with_id("Patient", "p1", json!({}))],
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition {
            from: SessionStatus::Errored,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_session_replaces_open_session() {
    let manager = manager(SyncSettings::default().with_max_concurrent_sessions(1)).await;
    let started = start(&manager, "f1").await;

    let parameters = SessionParameters {
        device_id: Some("tablet".to_string()),
        sync_all_patients: false,
        patient_ids: vec!["p1".to_string()],
        ..SessionParameters::default()
    };
    let created = manager.create_session("f1", parameters.clone()).await.unwrap();
    assert_eq!(created.facility_id, "f1");
    assert_eq!(created.status, SessionStatus::Created);
    assert_eq!(created.parameters, parameters);
    assert_eq!(created.pull_from_tick, 0);

    let report = manager.status(&started.id).await.unwrap();
    assert_eq!(report.session.status, SessionStatus::Errored);
    assert_eq!(manager.active_session_count().await.unwrap(), 1);

    let missing = manager
        .create_session(" ", SessionParameters::default())
        .await;
    assert!(matches!(missing, Err(Error::InvalidInput(_))));
}

async fn pushed_markers(manager: &SessionManager, facility_id: &str) -> HashSet<i64> {
    let db = manager.store().lock().await;
    LibSqlSessionRepository::new(db.connection())
        .pushed_ticks(facility_id, 0, i64::MAX)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sweep_prunes_pushed_ticks_past_retention() {
    let settings = SyncSettings::default().with_pushed_tick_retention(Duration::from_secs(3600));
    let manager = manager(settings).await;

    let session = start(&manager, "f1").await;
    manager.initiate_pull(&session.id).await.unwrap();
    manager
        .receive_push(
            &session.id,
            vec![SyncableRecord::with_id("Patient", "p1", json!({}))],
        )
        .await
        .unwrap();
    let outcome = manager.complete_push(&session.id).await.unwrap();
    assert_eq!(outcome.tick, Some(1));

    // f1 never syncs again, so nothing else clears its marker
    manager.sweep_stale_sessions(now_millis()).await.unwrap();
    assert_eq!(pushed_markers(&manager, "f1").await, HashSet::from([1]));

    manager
        .sweep_stale_sessions(now_millis() + 2 * 3_600_000)
        .await
        .unwrap();
    assert!(pushed_markers(&manager, "f1").await.is_empty());
}

#[test]
fn test_dedupe_keeps_last_copy_in_first_seen_order() {
    let records = vec![
        SyncableRecord::with_id("Patient", "p1", json!({"v": 1})),
        SyncableRecord::with_id("Encounter", "p1", json!({"v": 1})),
        SyncableRecord::with_id("Patient", "p2", json!({"v": 1})),
        SyncableRecord::with_id("Patient", "p1", json!({"v": 2})),
        SyncableRecord::with_id("Patient", "p1", json!({"v": 3})),
    ];

    let latest = dedupe_latest(records);
    let summary: Vec<(String, serde_json::Value)> = latest
        .into_iter()
        .map(|record| (record.label(), record.data))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("Patient:p1".to_string(), json!({"v": 3})),
            ("Encounter:p1".to_string(), json!({"v": 1})),
            ("Patient:p2".to_string(), json!({"v": 1})),
        ]
    );
}
