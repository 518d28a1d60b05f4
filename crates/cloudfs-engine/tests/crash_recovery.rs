//! Crash-window simulations: journal rows caught between `commit` and
//! `sync`, and the explicit repair pass that resolves them.

use std::sync::Arc;

use cloudfs_core::types::{HydrationState, JournalState};
use cloudfs_engine::hydration::HydrateOptions;
use cloudfs_engine::{Engine, ProviderSettings};
use cloudfs_provider::mock::MockProvider;

async fn repo_with_pushed_file() -> (tempfile::TempDir, Engine, Arc<MockProvider>, i64, i64) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("r");
    std::fs::create_dir_all(&root).unwrap();
    let engine = Engine::init(&root, None).unwrap();
    let provider = Arc::new(MockProvider::new("p1"));
    engine
        .register_provider(provider.clone(), ProviderSettings::default())
        .await
        .unwrap();

    std::fs::write(root.join("a.txt"), b"hello world").unwrap();
    let outcome = engine.add(&root.join("a.txt")).await.unwrap();
    engine.push().await.unwrap();
    let entry_id = outcome.entry.id;
    let version_id = outcome.version.unwrap().id;
    (dir, engine, provider, entry_id, version_id)
}

/// Manufacture the exact crash window: a `hydrate` journal row committed
/// but never synced, with the swap not yet durable.
fn plant_committed_hydrate(engine: &Engine, entry_id: i64, version_id: i64) -> String {
    let placement = engine
        .index()
        .best_placement(version_id)
        .unwrap()
        .expect("pushed version has a placement");
    let op = engine
        .journal()
        .begin(
            "hydrate",
            &serde_json::json!({
                "entry_id": entry_id,
                "version_id": version_id,
                "provider_id": placement.provider_id,
                "remote_path": placement.remote_path,
                "rel_path": "a.txt",
            }),
        )
        .unwrap();
    engine.journal().commit(&op).unwrap();
    op.as_str().to_string()
}

#[tokio::test]
async fn committed_hydrate_is_visible_after_reopen() {
    let (dir, engine, _provider, entry_id, version_id) = repo_with_pushed_file().await;
    let root = dir.path().join("r");
    let op_id = plant_committed_hydrate(&engine, entry_id, version_id);
    drop(engine);

    // Reopen: the row is reported, untouched — recovery is explicit.
    let engine = Engine::open(&root, None).unwrap();
    let pending = engine.journal().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_id, op_id);
    assert_eq!(pending[0].state, JournalState::Committed);

    // No half-file under the user-facing path.
    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
}

#[tokio::test]
async fn recovery_replays_swap_when_cache_holds_verified_bytes() {
    let (dir, engine, provider, entry_id, version_id) = repo_with_pushed_file().await;
    let root = dir.path().join("r");
    plant_committed_hydrate(&engine, entry_id, version_id);
    drop(engine);

    let engine = Engine::open(&root, None).unwrap();
    engine
        .register_provider(provider, ProviderSettings::default())
        .await
        .unwrap();
    let actions = engine.recover().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].action.contains("replayed swap"), "{actions:?}");

    // The add ingested the bytes into the cache, so replay completes the
    // hydrate rather than losing it.
    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello world");
    assert!(!root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(entry_id).unwrap().state,
        HydrationState::Hydrated
    );
    assert!(engine.journal().pending().unwrap().is_empty());
}

#[tokio::test]
async fn recovery_rolls_back_when_verified_bytes_are_gone() {
    let (dir, engine, provider, entry_id, version_id) = repo_with_pushed_file().await;
    let root = dir.path().join("r");

    // Drop the cached copy so the swap cannot be replayed.
    engine.cache_evict("a.txt", true).await.unwrap();
    let op_id = plant_committed_hydrate(&engine, entry_id, version_id);
    drop(engine);

    let engine = Engine::open(&root, None).unwrap();
    engine
        .register_provider(provider, ProviderSettings::default())
        .await
        .unwrap();
    let actions = engine.recover().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].action.contains("rolled back"), "{actions:?}");

    let row = engine.journal().operation(&op_id).unwrap().unwrap();
    assert_eq!(row.state, JournalState::RolledBack);
    assert!(row.rollback_reason.is_some());

    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(entry_id).unwrap().state,
        HydrationState::Placeholder
    );
}

#[tokio::test]
async fn pending_rows_roll_back_automatically() {
    let (_dir, engine, _provider, entry_id, _version_id) = repo_with_pushed_file().await;

    let op = engine
        .journal()
        .begin("hydrate", &serde_json::json!({ "entry_id": entry_id }))
        .unwrap();
    let op_id = op.as_str().to_string();

    let actions = engine.recover().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].action.contains("never committed"));

    let row = engine.journal().operation(&op_id).unwrap().unwrap();
    assert_eq!(row.state, JournalState::RolledBack);
}

#[tokio::test]
async fn committed_remote_operations_are_left_for_the_operator() {
    let (_dir, engine, provider, entry_id, version_id) = repo_with_pushed_file().await;

    let placement = engine
        .index()
        .best_placement(version_id)
        .unwrap()
        .unwrap();
    let op = engine
        .journal()
        .begin(
            "push",
            &serde_json::json!({
                "entry_id": entry_id,
                "version_id": version_id,
                "provider_id": placement.provider_id,
                "remote_path": placement.remote_path,
            }),
        )
        .unwrap();
    engine.journal().commit(&op).unwrap();

    let actions = engine.recover().await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].action.contains("left committed"), "{actions:?}");
    assert_eq!(engine.journal().pending().unwrap().len(), 1);

    // `journal resume` verifies the remote object and syncs.
    let resumed = engine.journal_resume(op.as_str()).await.unwrap();
    assert!(resumed.action.contains("synced"), "{resumed:?}");
    assert!(engine.journal().pending().unwrap().is_empty());

    // The other direction: a push whose upload never landed rolls back.
    let op = engine
        .journal()
        .begin(
            "push",
            &serde_json::json!({
                "entry_id": entry_id,
                "version_id": version_id,
                "provider_id": "p1",
                "remote_path": "entries/9/9/ghost.bin",
            }),
        )
        .unwrap();
    engine.journal().commit(&op).unwrap();
    assert!(!provider.contains("entries/9/9/ghost.bin").await);
    let resumed = engine.journal_resume(op.as_str()).await.unwrap();
    assert!(resumed.action.contains("rolled back"), "{resumed:?}");
}

#[tokio::test]
async fn repair_removes_residue_of_interrupted_dehydrate() {
    let (dir, engine, _provider, entry_id, _version_id) = repo_with_pushed_file().await;
    let root = dir.path().join("r");

    engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    engine.dehydrate("a.txt").await.unwrap();

    // Simulate the crash window inside dehydrate: placeholder written,
    // real file still present, state already `placeholder`.
    std::fs::write(root.join("a.txt"), b"hello world").unwrap();
    assert!(root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(entry_id).unwrap().state,
        HydrationState::Placeholder
    );

    let report = engine.repair().await.unwrap();
    assert_eq!(report.stale_reals_removed, 1);
    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
}

#[tokio::test]
async fn repair_recreates_missing_placeholders() {
    let (dir, engine, _provider, _entry_id, _version_id) = repo_with_pushed_file().await;
    let root = dir.path().join("r");

    std::fs::remove_file(root.join("a.txt.cloudfs")).unwrap();
    let report = engine.repair().await.unwrap();
    assert_eq!(report.placeholders_created, 1);
    assert!(root.join("a.txt.cloudfs").exists());

    // The recreated descriptor carries the placement location.
    let descriptor: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("a.txt.cloudfs")).unwrap()).unwrap();
    assert_eq!(descriptor["provider_id"], serde_json::json!("p1"));
}
