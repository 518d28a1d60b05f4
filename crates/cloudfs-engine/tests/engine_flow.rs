//! End-to-end add → push → hydrate → dehydrate flows against the in-memory
//! mock provider.

use std::path::Path;
use std::sync::Arc;

use cloudfs_core::types::{EntryKind, HydrationState, JournalState, PlacementState, VersionState};
use cloudfs_core::CloudfsError;
use cloudfs_engine::hydration::HydrateOptions;
use cloudfs_engine::{Engine, ProviderSettings};
use cloudfs_provider::mock::MockProvider;

const HELLO_HASH: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

async fn repo_with_provider() -> (tempfile::TempDir, Engine, Arc<MockProvider>) {
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

fn write_file(root: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = root.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[tokio::test]
async fn add_creates_entry_version_placeholder_and_cache() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();

    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();

    let entry = outcome.entry;
    assert_eq!(entry.name, "a.txt");
    assert_eq!(entry.kind, EntryKind::File);
    assert_eq!(entry.logical_size, 11);

    let version = outcome.version.unwrap();
    assert_eq!(version.version_num, 1);
    assert_eq!(version.state, VersionState::Active);
    assert_eq!(version.content_hash, HELLO_HASH);

    // Placeholder descriptor with the exact key set.
    let placeholder_path = root.join("a.txt.cloudfs");
    assert!(placeholder_path.exists());
    let descriptor: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&placeholder_path).unwrap()).unwrap();
    assert_eq!(descriptor["entry_id"], serde_json::json!(entry.id));
    assert_eq!(descriptor["version_id"], serde_json::json!(version.id));
    assert_eq!(descriptor["content_hash"], serde_json::json!(HELLO_HASH));
    assert_eq!(descriptor["logical_size"], serde_json::json!(11));
    assert_eq!(descriptor["is_placeholder"], serde_json::json!(true));
    assert_eq!(descriptor["original_name"], serde_json::json!("a.txt"));
    assert!(descriptor["created_at"].is_string());

    // The original was replaced by the placeholder; the bytes live in cache.
    assert!(!root.join("a.txt").exists());
    let cache_path = engine.cache().get(entry.id, version.id).unwrap().unwrap();
    assert_eq!(std::fs::read(cache_path).unwrap(), b"hello world");

    // Journal narrated the add to completion.
    let rows = engine.journal().recent(10).unwrap();
    assert!(rows
        .iter()
        .any(|r| r.operation_type == "add" && r.state == JournalState::Synced));
}

#[tokio::test]
async fn push_records_placement_without_hydrating() {
    let (_dir, engine, provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    let entry = outcome.entry;
    let version = outcome.version.unwrap();

    let report = engine.push().await.unwrap();
    assert_eq!(report.pushed.len(), 1);
    assert!(report.skipped.is_empty());
    assert_eq!(report.pushed[0].provider_id, "p1");

    let placements = engine.index().placements_for_version(version.id).unwrap();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].provider_id, "p1");
    assert_eq!(placements[0].state, PlacementState::Uploaded);
    assert!(provider.contains(&placements[0].remote_path).await);

    // Push does not hydrate.
    let hydration = engine.index().hydration(entry.id).unwrap();
    assert_eq!(hydration.state, HydrationState::Placeholder);
    assert!(!root.join("a.txt").exists());

    // A second push finds nothing to do.
    let report = engine.push().await.unwrap();
    assert!(report.pushed.is_empty());
}

#[tokio::test]
async fn hydrate_materializes_verified_bytes() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();

    let result = engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    assert!(!result.already_hydrated);
    assert_eq!(result.bytes_loaded, 11);

    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello world");
    assert!(!root.join("a.txt.cloudfs").exists());

    let hydration = engine.index().hydration(outcome.entry.id).unwrap();
    assert_eq!(hydration.state, HydrationState::Hydrated);
    assert_eq!(hydration.hydrated_version_id, Some(result.version_id));

    // Both push and hydrate reached `synced`.
    let rows = engine.journal().recent(20).unwrap();
    for op_type in ["push", "hydrate"] {
        assert!(
            rows.iter()
                .any(|r| r.operation_type == op_type && r.state == JournalState::Synced),
            "expected a synced {op_type} row"
        );
    }
}

#[tokio::test]
async fn hydrate_is_idempotent() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    engine.add(&path).await.unwrap();
    engine.push().await.unwrap();

    let first = engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    let second = engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    assert!(!first.already_hydrated);
    assert!(second.already_hydrated);
}

#[tokio::test]
async fn hydrate_dehydrate_hydrate_roundtrip() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();

    engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    engine.dehydrate("a.txt").await.unwrap();

    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
    let hydration = engine.index().hydration(outcome.entry.id).unwrap();
    assert_eq!(hydration.state, HydrationState::Placeholder);

    engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello world");
    assert!(!root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(outcome.entry.id).unwrap().state,
        HydrationState::Hydrated
    );
}

#[tokio::test]
async fn dehydrate_refused_without_placement() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    engine.add(&path).await.unwrap();

    // Not pushed yet: dehydrating would strand the only copy.
    let err = engine.dehydrate("a.txt").await.unwrap_err();
    assert!(matches!(err, CloudfsError::NoPlacement(_)), "got {err:?}");
}

#[tokio::test]
async fn corrupted_download_is_rejected_before_any_swap() {
    let (_dir, engine, provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();
    engine.cache_evict("a.txt", true).await.unwrap();

    provider.corrupt_downloads(true);
    let err = engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CloudfsError::HashMismatch { .. }), "got {err:?}");

    // No partial data reached the projection; state unwound.
    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(outcome.entry.id).unwrap().state,
        HydrationState::Placeholder
    );
    let rows = engine.journal().recent(5).unwrap();
    assert!(rows
        .iter()
        .any(|r| r.operation_type == "hydrate" && r.state == JournalState::RolledBack));

    // Healthy remote again: hydration succeeds.
    provider.corrupt_downloads(false);
    engine
        .hydrate("a.txt", &HydrateOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello world");
}

#[tokio::test]
async fn readd_supersedes_active_version() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();

    let path = write_file(&root, "c.txt", b"first contents");
    let first = engine.add(&path).await.unwrap();
    let v1 = first.version.unwrap();

    let path = write_file(&root, "c.txt", b"second contents!");
    let second = engine.add(&path).await.unwrap();
    let v2 = second.version.unwrap();

    assert_eq!(first.entry.id, second.entry.id);
    assert_eq!(v2.version_num, 2);
    assert_eq!(
        engine.index().version(v1.id).unwrap().unwrap().state,
        VersionState::Superseded
    );
    assert_eq!(
        engine
            .index()
            .active_version(first.entry.id)
            .unwrap()
            .unwrap()
            .id,
        v2.id
    );
}

#[tokio::test]
async fn batch_hydration_is_sequential_and_complete() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    for (name, content) in [("x.txt", "xxx"), ("y.txt", "yyyy"), ("z.txt", "zzzzz")] {
        let path = write_file(&root, name, content.as_bytes());
        engine.add(&path).await.unwrap();
    }
    engine.push().await.unwrap();

    let paths: Vec<String> = ["x.txt", "y.txt", "z.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let results = engine
        .hydrate_batch(&paths, &HydrateOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    for (path, result) in results {
        result.unwrap_or_else(|e| panic!("{path}: {e}"));
        assert!(root.join(&path).exists());
    }
}

#[tokio::test]
async fn cancelled_token_unwinds_to_placeholder() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();

    let opts = HydrateOptions::default();
    opts.cancel.cancel();
    let err = engine.hydrate("a.txt", &opts).await.unwrap_err();
    assert!(matches!(err, CloudfsError::Cancelled), "got {err:?}");

    assert!(!root.join("a.txt").exists());
    assert!(root.join("a.txt.cloudfs").exists());
    assert_eq!(
        engine.index().hydration(outcome.entry.id).unwrap().state,
        HydrationState::Placeholder
    );
}

#[tokio::test]
async fn encrypted_repository_survives_reopen_and_rejects_wrong_key() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("r");
    std::fs::create_dir_all(&root).unwrap();

    {
        let engine = Engine::init(&root, Some("correct horse")).unwrap();
        std::fs::write(root.join("a.txt"), b"hello world").unwrap();
        engine.add(&root.join("a.txt")).await.unwrap();
    }

    let err = Engine::open(&root, Some("battery staple")).unwrap_err();
    assert!(matches!(err, CloudfsError::WrongKey), "got {err:?}");

    let engine = Engine::open(&root, Some("correct horse")).unwrap();
    let items = engine.ls(None).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].entry.name, "a.txt");
    assert_eq!(
        items[0].active_version.as_ref().unwrap().content_hash,
        HELLO_HASH
    );
}

#[tokio::test]
async fn pinned_cache_entries_refuse_eviction() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    engine.add(&path).await.unwrap();

    engine.pin("a.txt").await.unwrap();
    let err = engine.cache_evict("a.txt", true).await.unwrap_err();
    assert!(matches!(err, CloudfsError::Pinned), "got {err:?}");

    engine.unpin("a.txt").await.unwrap();
    engine.cache_evict("a.txt", true).await.unwrap();
}

#[tokio::test]
async fn pin_after_hydration_survives_clear() {
    let (_dir, engine, _provider) = repo_with_provider().await;
    let root = engine.layout().root().to_path_buf();
    let path = write_file(&root, "a.txt", b"hello world");
    let outcome = engine.add(&path).await.unwrap();
    engine.push().await.unwrap();

    let opts = HydrateOptions {
        pin_after: true,
        ..Default::default()
    };
    engine.hydrate("a.txt", &opts).await.unwrap();

    assert_eq!(engine.cache_clear(true).await.unwrap(), 0);
    let version = outcome.version.unwrap();
    assert!(engine
        .cache()
        .get(outcome.entry.id, version.id)
        .unwrap()
        .is_some());
}
