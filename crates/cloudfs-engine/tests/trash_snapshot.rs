//! Trash, purge, snapshot, and placement-planner behavior.

use std::sync::Arc;

use cloudfs_core::types::{PlacementState, VersionState};
use cloudfs_core::CloudfsError;
use cloudfs_engine::{Engine, ProviderSettings};
use cloudfs_provider::mock::MockProvider;
use cloudfs_provider::Provider;

async fn repo() -> (tempfile::TempDir, Engine, Arc<MockProvider>) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("r");
    std::fs::create_dir_all(&root).unwrap();
    let engine = Engine::init(&root, None).unwrap();
    let provider = Arc::new(MockProvider::new("p1"));
    engine
        .register_provider(provider.clone(), ProviderSettings::default())
        .await
        .unwrap();
    (dir, engine, provider)
}

async fn add_and_push(engine: &Engine, name: &str, bytes: &[u8]) -> (i64, i64) {
    let path = engine.layout().root().join(name);
    std::fs::write(&path, bytes).unwrap();
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();
    (outcome.entry.id, outcome.version.unwrap().id)
}

// ── Trash ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rm_moves_to_trash_without_touching_remote() {
    let (_dir, engine, provider) = repo().await;
    let (entry_id, version_id) = add_and_push(&engine, "a.txt", b"hello world").await;

    engine.rm("a.txt").await.unwrap();

    let trash = engine.trash().list().unwrap();
    assert_eq!(trash.len(), 1);
    assert_eq!(trash[0].entry.original_entry_id, entry_id);
    assert_eq!(trash[0].entry.version_id, Some(version_id));

    // Versions flip to `deleted`; rows, cache, and remote all survive.
    let version = engine.index().version(version_id).unwrap().unwrap();
    assert_eq!(version.state, VersionState::Deleted);
    assert_eq!(provider.object_count().await, 1);
    assert!(engine.index().entry(entry_id).unwrap().is_some());
}

#[tokio::test]
async fn trash_restore_roundtrip_restores_active_set() {
    let (_dir, engine, _provider) = repo().await;
    let (entry_id, version_id) = add_and_push(&engine, "a.txt", b"hello world").await;

    engine.rm("a.txt").await.unwrap();
    let info = engine.trash().get_by_path("a.txt").unwrap().unwrap();
    engine.trash().restore(info.entry.id).unwrap();

    assert!(engine.trash().list().unwrap().is_empty());
    assert_eq!(
        engine.index().active_version(entry_id).unwrap().unwrap().id,
        version_id
    );
}

#[tokio::test]
async fn purge_requires_confirmation() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "a.txt", b"hello world").await;
    engine.rm("a.txt").await.unwrap();

    let info = engine.trash().get_by_path("a.txt").unwrap().unwrap();
    let err = engine.trash().purge(info.entry.id, false).await.unwrap_err();
    assert!(matches!(err, CloudfsError::NeedsConfirmation), "got {err:?}");
    assert_eq!(engine.trash().list().unwrap().len(), 1);
}

#[tokio::test]
async fn confirmed_purge_deletes_remote_then_local_rows() {
    let (_dir, engine, provider) = repo().await;
    let (entry_id, version_id) = add_and_push(&engine, "a.txt", b"hello world").await;
    engine.rm("a.txt").await.unwrap();

    let info = engine.trash().get_by_path("a.txt").unwrap().unwrap();
    let outcome = engine.trash().purge(info.entry.id, true).await.unwrap();

    assert_eq!(outcome.purged, 1);
    assert_eq!(outcome.remote_deleted, 1);
    assert_eq!(outcome.remote_failed, 0);
    assert_eq!(provider.object_count().await, 0);
    assert!(engine.index().entry(entry_id).unwrap().is_none());
    assert!(engine
        .index()
        .placements_for_version(version_id)
        .unwrap()
        .is_empty());
    assert!(engine.trash().list().unwrap().is_empty());
}

#[tokio::test]
async fn failed_remote_delete_degrades_placement_and_keeps_rows() {
    let (_dir, engine, provider) = repo().await;
    let (entry_id, version_id) = add_and_push(&engine, "a.txt", b"hello world").await;
    engine.rm("a.txt").await.unwrap();

    provider.fail_deletes(true);
    let info = engine.trash().get_by_path("a.txt").unwrap().unwrap();
    let outcome = engine.trash().purge(info.entry.id, true).await.unwrap();

    assert_eq!(outcome.purged, 0);
    assert_eq!(outcome.remote_failed, 1);
    assert!(!outcome.errors.is_empty());

    // The placement row is downgraded, the entry row persists, and the
    // trash entry remains retryable.
    let placements = engine.index().placements_for_version(version_id).unwrap();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].state, PlacementState::Degraded);
    assert!(engine.index().entry(entry_id).unwrap().is_some());
    assert_eq!(engine.trash().list().unwrap().len(), 1);

    // Retry after the remote recovers.
    provider.fail_deletes(false);
    let outcome = engine.trash().purge(info.entry.id, true).await.unwrap();
    assert_eq!(outcome.purged, 1);
    assert!(engine.index().entry(entry_id).unwrap().is_none());
}

#[tokio::test]
async fn purge_expired_only_touches_expired_rows() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "fresh.txt", b"fresh").await;
    engine.rm("fresh.txt").await.unwrap();

    // Nothing is past its deadline.
    let outcome = engine.trash().purge_expired(true).await.unwrap();
    assert_eq!(outcome.purged, 0);
    assert_eq!(engine.trash().list().unwrap().len(), 1);
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_restore_rolls_version_states_without_remote_deletes() {
    let (_dir, engine, provider) = repo().await;
    let root = engine.layout().root().to_path_buf();

    let (entry_id, v1_id) = add_and_push(&engine, "c.txt", b"first contents").await;
    engine.snapshots().create("S", Some("before rework")).unwrap();

    // Evolve the version chain.
    std::fs::write(root.join("c.txt"), b"second contents!").unwrap();
    let outcome = engine.add(&root.join("c.txt")).await.unwrap();
    let v2_id = outcome.version.unwrap().id;
    engine.push().await.unwrap();
    let objects_before = provider.object_count().await;

    engine.snapshots().restore("S").unwrap();

    assert_eq!(
        engine.index().version(v2_id).unwrap().unwrap().state,
        VersionState::Superseded
    );
    assert_eq!(
        engine.index().version(v1_id).unwrap().unwrap().state,
        VersionState::Active
    );
    assert_eq!(
        engine.index().active_version(entry_id).unwrap().unwrap().id,
        v1_id
    );
    // Restore is metadata-only.
    assert_eq!(provider.object_count().await, objects_before);
}

#[tokio::test]
async fn snapshot_restore_is_a_noop_on_unchanged_state() {
    let (_dir, engine, _provider) = repo().await;
    let (entry_id, v1_id) = add_and_push(&engine, "c.txt", b"first contents").await;

    engine.snapshots().create("S", None).unwrap();
    let preview = engine.snapshots().restore_preview("S").unwrap();
    assert_eq!(preview.version_changes, 0);

    engine.snapshots().restore("S").unwrap();
    assert_eq!(
        engine.index().active_version(entry_id).unwrap().unwrap().id,
        v1_id
    );
}

#[tokio::test]
async fn snapshot_names_are_unique_and_inspectable() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "c.txt", b"first contents").await;

    engine.snapshots().create("S", None).unwrap();
    let err = engine.snapshots().create("S", None).unwrap_err();
    assert!(matches!(err, CloudfsError::AlreadyExists(_)), "got {err:?}");

    let details = engine.snapshots().inspect("S").unwrap();
    assert_eq!(details.entry_count, 1);
    assert_eq!(details.version_count, 1);
    assert_eq!(details.total_size, 14);

    engine.snapshots().delete("S").unwrap();
    assert!(engine.snapshots().list().unwrap().is_empty());
    // The captured version survives snapshot deletion.
    assert_eq!(engine.index().versions_for_entry(1).unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_restore_refused_with_unresolved_journal() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "c.txt", b"first contents").await;
    engine.snapshots().create("S", None).unwrap();

    let op = engine
        .journal()
        .begin("hydrate", &serde_json::json!({ "entry_id": 1 }))
        .unwrap();
    let err = engine.snapshots().restore("S").unwrap_err();
    assert!(matches!(err, CloudfsError::Busy(_)), "got {err:?}");

    engine.journal().rollback(&op, "test cleanup").unwrap();
    engine.snapshots().restore("S").unwrap();
}

// ── Placement planner ─────────────────────────────────────────────────────────

#[tokio::test]
async fn planner_rejects_providers_without_live_space() {
    let (_dir, engine, _provider) = repo().await;
    let tiny = Arc::new(MockProvider::new("tiny").with_capacity(4));
    engine
        .register_provider(
            tiny,
            ProviderSettings {
                priority: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let plan = engine.planner().plan("big.bin", 1024, false).await.unwrap();
    // `tiny` is rejected on live free space despite its better priority and
    // untouched cached-usage column.
    assert!(plan
        .rejected
        .iter()
        .any(|r| r.provider_id == "tiny" && r.reason.contains("insufficient space")));
    assert_eq!(plan.placements.len(), 1);
    assert_eq!(plan.placements[0].provider_id, "p1");
}

#[tokio::test]
async fn planner_enforces_encryption_requirement() {
    let (_dir, engine, _provider) = repo().await;
    let strict = Arc::new(MockProvider::new("strict").with_required_encryption());
    engine
        .register_provider(
            strict,
            ProviderSettings {
                priority: 0,
                requires_encryption: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let plan = engine.planner().plan("f.bin", 10, false).await.unwrap();
    assert!(plan
        .rejected
        .iter()
        .any(|r| r.provider_id == "strict" && r.reason.contains("encrypted")));

    let plan = engine.planner().plan("f.bin", 10, true).await.unwrap();
    assert!(plan.placements.iter().any(|p| p.provider_id == "strict"));
}

#[tokio::test]
async fn revalidate_fails_when_space_disappears() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("r");
    std::fs::create_dir_all(&root).unwrap();
    let engine = Engine::init(&root, None).unwrap();
    let provider = Arc::new(MockProvider::new("p1").with_capacity(100));
    engine
        .register_provider(provider.clone(), ProviderSettings::default())
        .await
        .unwrap();

    let mut plan = engine.planner().plan("f.bin", 60, false).await.unwrap();
    assert_eq!(plan.placements.len(), 1);

    // Another upload eats the space between plan and push.
    let filler = root.join("filler");
    std::fs::write(&filler, vec![0u8; 80]).unwrap();
    provider.upload(&filler, "filler", None).await.unwrap();

    let err = engine.planner().revalidate(&mut plan).await.unwrap_err();
    assert!(matches!(err, CloudfsError::LimitExceeded { .. }), "got {err:?}");
}

// ── Providers ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn provider_removal_guarded_by_placements() {
    let (_dir, engine, provider) = repo().await;
    add_and_push(&engine, "a.txt", b"hello world").await;

    let err = engine.remove_provider("p1", false, true).await.unwrap_err();
    assert!(matches!(err, CloudfsError::InvalidInput(_)), "got {err:?}");

    // With data deletion (confirmed), the placements are removed through
    // the delete coordinator and the provider can go.
    engine.remove_provider("p1", true, true).await.unwrap();
    assert_eq!(provider.object_count().await, 0);
    assert!(engine.index().provider("p1").unwrap().is_none());
    assert!(engine.registry().get("p1").unwrap().is_none());
}

#[tokio::test]
async fn first_registered_provider_is_primary() {
    let (_dir, engine, _provider) = repo().await;
    let second = Arc::new(MockProvider::new("p2"));
    engine
        .register_provider(second, ProviderSettings::default())
        .await
        .unwrap();

    let primary = engine.registry().primary().unwrap().unwrap();
    assert_eq!(primary.id(), "p1");
    engine.registry().set_primary("p2").unwrap();
    assert_eq!(engine.registry().primary().unwrap().unwrap().id(), "p2");
}

// ── Read-only views ───────────────────────────────────────────────────────────

#[tokio::test]
async fn explain_and_overview_reflect_state() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "a.txt", b"hello world").await;

    let explanation = engine.explain("a.txt").unwrap();
    assert_eq!(explanation.path, "a.txt");
    assert!(explanation.active_version.is_some());
    assert!(explanation
        .locations
        .iter()
        .any(|l| l.location_type == "provider"));
    assert!(explanation
        .locations
        .iter()
        .any(|l| l.location_type == "placeholder"));
    assert!(explanation.cache.is_cached);
    assert!(explanation.trash.is_none());
    // One placement, never verified: 1.0 - 0.2 - 0.3.
    assert!((explanation.health.score - 0.5).abs() < 1e-9);

    let overview = engine.overview().unwrap();
    assert_eq!(overview.file_count, 1);
    assert_eq!(overview.placement_count, 1);
    assert_eq!(overview.cache.total_entries, 1);
    assert_eq!(overview.unresolved_journal_count, 0);

    engine.verify_placements().await.unwrap();
    let explanation = engine.explain("a.txt").unwrap();
    assert!((explanation.health.score - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn scans_are_clean_on_a_healthy_repository() {
    let (_dir, engine, _provider) = repo().await;
    add_and_push(&engine, "a.txt", b"hello world").await;

    use cloudfs_engine::scanner::Severity;
    let report = engine.scan_index().unwrap();
    assert_eq!(report.count(Severity::Error), 0);
    assert_eq!(report.count(Severity::Warning), 0);

    let report = engine.scan_cache().unwrap();
    assert_eq!(report.count(Severity::Warning), 0);

    let report = engine.scan_providers().await.unwrap();
    assert_eq!(report.count(Severity::Error), 0);
}
