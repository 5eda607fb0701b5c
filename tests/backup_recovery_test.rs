// Integration tests for backup and restore through the BackupManager
// Uses the in-memory engine, object store, lock store and catalog

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{harness, harness_with, principal, seed_directory, test_config};
use configvault::audit::{AuditAction, AuditOutcome};
use configvault::backup::{
    BackendKind, FileCatalog, RestoreOutcome, RetentionPolicy, ScheduleTag, SnapshotEvent,
};
use configvault::engine::InMemoryEngine;
use configvault::restore::{RestoreMode, RestorePhase, RestoreRequest};
use configvault::store::{ObjectVersionStore, VersionToken};
use configvault::VaultError;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_resource_backup_records_summary() {
    let h = harness();
    seed_directory(&h.engine, "acme", 150, 40);

    let manifest = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .expect("backup should succeed");

    let expected: BTreeMap<String, usize> = BTreeMap::from([("memberships".to_string(), 40), ("principals".to_string(), 150)]);
    assert_eq!(manifest.resource_summary(), Some(&expected));
    assert_eq!(manifest.backend_kind(), BackendKind::Resource);
    assert_eq!(manifest.created_by, "tester");
    assert!(matches!(manifest.event, SnapshotEvent::Backup));

    let stored = h
        .manager
        .get_snapshot("acme", &manifest.snapshot_id)
        .await
        .unwrap()
        .expect("manifest should be cataloged");
    assert_eq!(stored, manifest);
    assert_eq!(stored.created_at, manifest.created_at);
}

#[tokio::test]
async fn test_filtered_dry_run_reports_only_selected_category() {
    let h = harness();
    seed_directory(&h.engine, "acme", 150, 40);
    h.manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Daily, RetentionPolicy::unlimited())
        .await
        .unwrap();

    let result = h
        .manager
        .restore(
            RestoreRequest::latest("acme", BackendKind::Resource)
                .filter(["memberships"])
                .dry_run(true),
        )
        .await
        .unwrap();

    let report = result.report().expect("dry run returns a report");
    let plan = report.resource_plan().unwrap();
    assert_eq!(plan.total_records(), 40);
    assert_eq!(plan.categories.len(), 1);
    assert_eq!(plan.category("memberships").unwrap().unchanged, 40);
    assert!(plan.category("principals").is_none());
    assert_eq!(
        report.phases,
        vec![RestorePhase::Validated, RestorePhase::DryRunReported, RestorePhase::Completed]
    );

    // Nothing written, nothing locked
    assert_eq!(h.engine.upserts(), 0);
    assert!(h.manager.lock().holder("acme").await.unwrap().is_none());
    assert_eq!(h.manager.list_snapshots("acme", None).await.unwrap().len(), 1);

    let audit = h.manager.audit().events_for("acme").await;
    assert_eq!(audit.last().unwrap().action, AuditAction::DryRun);
}

#[tokio::test]
async fn test_resource_restore_is_additive() {
    let h = harness();
    h.engine.seed("acme", vec![principal("u1", "Ada"), principal("u2", "Grace")]);
    let backup = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();

    // Drift after the backup: one edit, one deletion, one new principal
    h.engine.seed("acme", vec![principal("u1", "Ada Lovelace"), principal("u3", "Linus")]);
    h.engine.remove("acme", "principals", "u2");

    let result = h
        .manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::Resource, &backup.snapshot_id))
        .await
        .unwrap();

    assert_eq!(h.engine.record("acme", "principals", "u1").unwrap().attributes["display_name"], "Ada");
    assert!(h.engine.record("acme", "principals", "u2").is_some());
    // Not in the snapshot, left alone
    assert_eq!(h.engine.record("acme", "principals", "u3").unwrap().attributes["display_name"], "Linus");

    let recorded = result.manifest().expect("restore returns its manifest");
    assert_eq!(recorded.resource_summary().unwrap()["principals"], 3);
    match &recorded.event {
        SnapshotEvent::Restore {
            source_snapshot_id,
            outcome,
            ..
        } => {
            assert_eq!(source_snapshot_id, &backup.snapshot_id);
            assert_eq!(*outcome, RestoreOutcome::Applied);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let latest = h.manager.latest_snapshot("acme", BackendKind::Resource).await.unwrap().unwrap();
    assert_eq!(latest.snapshot_id, recorded.snapshot_id);
    assert!(h.manager.lock().holder("acme").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resource_restore_is_safe_to_rerun() {
    let h = harness();
    seed_directory(&h.engine, "acme", 10, 5);
    let backup = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    let request = RestoreRequest::snapshot("acme", BackendKind::Resource, &backup.snapshot_id);

    assert_ok!(h.manager.restore(request.clone()).await);
    assert_ok!(h.manager.restore(request).await);

    assert_eq!(h.engine.count("acme", "principals"), 10);
    assert_eq!(h.engine.count("acme", "memberships"), 5);
}

#[tokio::test]
async fn test_state_restore_writes_new_version_with_old_bytes() {
    let h = harness();
    let key = InMemoryEngine::state_key("acme");
    for serial in 1..=17 {
        h.engine
            .apply_configuration("acme", serial, vec![principal(&format!("u{}", serial), "x")])
            .await
            .unwrap();
    }

    let backup = h
        .manager
        .backup("acme", BackendKind::State, ScheduleTag::Weekly, RetentionPolicy::unlimited())
        .await
        .unwrap();
    assert_eq!(backup.state_pointer().unwrap().version.as_str(), "v17");

    for serial in 18..=20 {
        h.engine
            .apply_configuration("acme", serial, vec![principal(&format!("u{}", serial), "x")])
            .await
            .unwrap();
    }

    let result = h
        .manager
        .restore(
            RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id).mode(RestoreMode::StateOnly),
        )
        .await
        .unwrap();
    let restored = result.manifest().unwrap().state_pointer().unwrap().clone();
    assert_eq!(restored.version.as_str(), "v21");
    assert_eq!(restored.content_hash, backup.state_pointer().unwrap().content_hash);

    let v17 = h.store.get(&key, Some(&VersionToken::new("v17"))).await.unwrap();
    let v21 = h.store.get(&key, None).await.unwrap();
    assert_eq!(v17, v21);

    let versions: Vec<String> = h
        .manager
        .list_state_versions("acme", 5)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.version.as_str().to_string())
        .collect();
    assert_eq!(versions, vec!["v21", "v20", "v19", "v18", "v17"]);

    // State-only mode never calls the engine
    assert_eq!(h.engine.applies(), 0);
}

#[tokio::test]
async fn test_state_restore_twice_is_idempotent() {
    let h = harness();
    for serial in 1..=3 {
        h.engine
            .apply_configuration("acme", serial, vec![principal(&format!("u{}", serial), "x")])
            .await
            .unwrap();
    }
    let backup = h
        .manager
        .backup("acme", BackendKind::State, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    h.engine.apply_configuration("acme", 4, vec![principal("u4", "x")]).await.unwrap();

    let request = RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id);
    let first = h.manager.restore(request.clone()).await.unwrap();
    let second = h.manager.restore(request).await.unwrap();

    let first = first.manifest().unwrap();
    let second = second.manifest().unwrap();
    assert_eq!(
        first.state_pointer().unwrap().content_hash,
        second.state_pointer().unwrap().content_hash
    );
    // The second restore found the target already current and wrote nothing
    assert_eq!(second.state_pointer().unwrap().version.as_str(), "v5");
    assert!(matches!(
        second.event,
        SnapshotEvent::Restore {
            outcome: RestoreOutcome::AlreadyCurrent,
            ..
        }
    ));
    assert_eq!(h.manager.list_state_versions("acme", 10).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_full_restore_reconciles_live_entities() {
    let h = harness();
    h.engine.apply_configuration("acme", 1, vec![principal("u1", "Ada")]).await.unwrap();
    let backup = h
        .manager
        .backup("acme", BackendKind::State, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    h.engine.apply_configuration("acme", 2, vec![principal("u1", "Changed")]).await.unwrap();

    let dry_run = h
        .manager
        .restore(
            RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id)
                .mode(RestoreMode::FullRestore)
                .dry_run(true),
        )
        .await
        .unwrap();
    let plan = dry_run.report().unwrap().state_plan().unwrap().clone();
    assert_eq!(plan.current.version.as_str(), "v2");
    assert_eq!(plan.target.version.as_str(), "v1");
    assert!(!plan.already_current);

    h.manager
        .restore(
            RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id).mode(RestoreMode::FullRestore),
        )
        .await
        .unwrap();

    assert_eq!(h.engine.applies(), 1);
    assert_eq!(h.engine.record("acme", "principals", "u1").unwrap().attributes["display_name"], "Ada");
}

#[tokio::test]
async fn test_full_restore_reconciles_drift_when_state_is_current() {
    let h = harness();
    h.engine.apply_configuration("acme", 1, vec![principal("u1", "Ada")]).await.unwrap();
    let backup = h
        .manager
        .backup("acme", BackendKind::State, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    // Live entity drifts while the state object stays at v1
    h.engine.seed("acme", vec![principal("u1", "Drifted")]);

    let result = h
        .manager
        .restore(
            RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id).mode(RestoreMode::FullRestore),
        )
        .await
        .unwrap();

    assert_eq!(h.engine.applies(), 1);
    assert_eq!(h.engine.record("acme", "principals", "u1").unwrap().attributes["display_name"], "Ada");
    let manifest = result.manifest().unwrap();
    assert_eq!(manifest.state_pointer().unwrap().version.as_str(), "v1");
    assert!(matches!(
        manifest.event,
        SnapshotEvent::Restore {
            outcome: RestoreOutcome::Applied,
            ..
        }
    ));
    assert_eq!(h.manager.list_state_versions("acme", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_restore_after_state_only_restore_applies_entities() {
    let h = harness();
    h.engine.apply_configuration("acme", 1, vec![principal("u1", "Ada")]).await.unwrap();
    let backup = h
        .manager
        .backup("acme", BackendKind::State, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    h.engine.apply_configuration("acme", 2, vec![principal("u1", "Changed")]).await.unwrap();

    let request = RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id);
    h.manager.restore(request.clone()).await.unwrap();
    assert_eq!(h.engine.applies(), 0);
    assert_eq!(h.engine.record("acme", "principals", "u1").unwrap().attributes["display_name"], "Changed");

    // State already matches v1, so only the reconcile step runs
    h.manager.restore(request.mode(RestoreMode::FullRestore)).await.unwrap();

    assert_eq!(h.engine.applies(), 1);
    assert_eq!(h.engine.record("acme", "principals", "u1").unwrap().attributes["display_name"], "Ada");
    assert_eq!(h.manager.list_state_versions("acme", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_partial_failure_records_manifest_and_lists_records() {
    let h = harness();
    h.engine.seed("acme", vec![principal("u1", "Ada"), principal("u2", "Grace")]);
    let backup = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    h.engine.remove("acme", "principals", "u1");
    h.engine.remove("acme", "principals", "u2");
    h.engine.fail_record("principals", "u2");

    let err = h
        .manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::Resource, &backup.snapshot_id))
        .await
        .unwrap_err();

    let VaultError::PartialApplyFailure {
        snapshot_id,
        recorded_snapshot_id,
        failures,
        ..
    } = err
    else {
        panic!("expected a partial failure");
    };
    assert_eq!(snapshot_id, backup.snapshot_id);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].record_id, "u2");
    assert!(h.engine.record("acme", "principals", "u1").is_some());

    // No rollback; the post-restore state is on record
    let recorded = h.manager.get_snapshot("acme", &recorded_snapshot_id).await.unwrap().unwrap();
    assert_eq!(recorded.resource_summary().unwrap()["principals"], 1);
    assert!(matches!(
        recorded.event,
        SnapshotEvent::Restore {
            outcome: RestoreOutcome::Partial,
            ..
        }
    ));
    assert!(h.manager.lock().holder("acme").await.unwrap().is_none());

    let audit = h.manager.audit().events_for("acme").await;
    assert_eq!(audit.last().unwrap().outcome, AuditOutcome::PartiallyApplied);

    // Re-running once the record converges finishes the job
    h.engine.heal_record("principals", "u2");
    h.manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::Resource, &backup.snapshot_id))
        .await
        .unwrap();
    assert!(h.engine.record("acme", "principals", "u2").is_some());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_locking() {
    let h = harness();
    seed_directory(&h.engine, "acme", 3, 0);
    let backup = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();

    let unknown_category = h
        .manager
        .restore(RestoreRequest::latest("acme", BackendKind::Resource).filter(["roles"]))
        .await;
    let mode_on_resource = h
        .manager
        .restore(RestoreRequest::latest("acme", BackendKind::Resource).mode(RestoreMode::FullRestore))
        .await;
    let wrong_kind = h
        .manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::State, &backup.snapshot_id))
        .await;
    let unknown_snapshot = h
        .manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::Resource, "2020-01-01T00-00-00-000-abcdef"))
        .await;
    let traversal = h
        .manager
        .restore(RestoreRequest::snapshot("acme", BackendKind::Resource, "../../etc/passwd"))
        .await;
    let nothing_yet = h.manager.restore(RestoreRequest::latest("globex", BackendKind::State)).await;

    for result in [unknown_category, mode_on_resource, wrong_kind, unknown_snapshot, traversal, nothing_yet] {
        let err = assert_err!(result);
        assert!(matches!(err, VaultError::Validation(_)), "unexpected error {:?}", err);
    }
    assert_eq!(h.engine.upserts(), 0);
    assert_eq!(h.manager.list_snapshots("acme", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retention_prunes_oldest_and_keeps_latest() {
    let h = harness();
    seed_directory(&h.engine, "acme", 2, 0);

    let mut ids = Vec::new();
    for _ in 0..4 {
        let manifest = h
            .manager
            .backup("acme", BackendKind::Resource, ScheduleTag::Daily, RetentionPolicy::keep(2))
            .await
            .unwrap();
        ids.push(manifest.snapshot_id);
    }

    let remaining: Vec<String> = h
        .manager
        .list_snapshots("acme", Some(BackendKind::Resource))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.snapshot_id)
        .collect();
    assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);

    let latest = h.manager.latest_snapshot("acme", BackendKind::Resource).await.unwrap().unwrap();
    assert_eq!(latest.snapshot_id, ids[3]);

    // Pruning only drops manifests; the payloads stay in the store
    let first_key = format!("acme/resource/{}/principals.json", ids[0]);
    assert!(h.store.get(&first_key, None).await.is_ok());
}

#[tokio::test]
async fn test_environments_are_isolated() {
    let h = harness();
    seed_directory(&h.engine, "acme", 2, 0);
    seed_directory(&h.engine, "globex", 5, 0);

    h.manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    let globex = h
        .manager
        .backup("globex", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();

    assert_eq!(globex.resource_summary().unwrap()["principals"], 5);
    assert_eq!(h.manager.list_snapshots("acme", None).await.unwrap().len(), 1);
    assert!(h.manager.get_snapshot("acme", &globex.snapshot_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_catalog_persists_layout() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(test_config(), Arc::new(FileCatalog::new(dir.path())));
    h.engine.seed("acme", vec![principal("u1", "Ada")]);

    let manifest = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();

    let kind_dir = dir.path().join("acme").join("resource");
    assert!(kind_dir.join(format!("{}.json", manifest.snapshot_id)).exists());
    assert!(kind_dir.join("latest.json").exists());

    // A second catalog over the same directory sees the same history
    let reopened = FileCatalog::new(dir.path());
    let listed = configvault::backup::SnapshotCatalog::list(&reopened, "acme", None).await.unwrap();
    assert_eq!(listed, vec![manifest]);
}

#[tokio::test]
async fn test_restore_manifest_carries_instructions() {
    let h = harness();
    h.engine.seed("acme", vec![principal("u1", "Ada")]);
    let manifest = h
        .manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();

    assert!(manifest.restore_instructions["dry_run"].contains(&manifest.snapshot_id));
    assert!(manifest.restore_instructions.contains_key("selective"));
    assert_eq!(
        serde_json::to_value(&manifest).unwrap()["payload"]["backend_kind"],
        json!("resource")
    );
}
