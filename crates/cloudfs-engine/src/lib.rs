//! CloudFS engine: the correctness and crash-safety core.
//!
//! The [`Engine`] wires the encrypted index, the write-ahead journal, and
//! the component layers together with explicit dependencies — no process
//! globals. Every externally visible state change is journaled; the index
//! is the source of truth and the filesystem projection is derived.

pub mod archive;
pub mod cache;
pub mod dashboard;
pub mod deletion;
pub mod explain;
pub mod hashing;
pub mod health;
pub mod hydration;
mod ingest;
pub mod placeholder;
pub mod planner;
mod recovery;
pub mod scanner;
pub mod snapshot;
pub mod trash;

pub use ingest::{AddOutcome, PushReport, PushedItem, SkippedItem, VerifySummary};
pub use recovery::{RecoveryAction, RepairReport};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudfs_core::types::{
    Entry, EntryKind, Hydration, ProviderRecord, ProviderStatus, Version, VersionState,
};
use cloudfs_core::{CloudfsConfig, CloudfsError, CloudfsResult, RepoLayout};
use cloudfs_index::{schema, EncryptedStore, Index, Journal, NewProvider};
use cloudfs_provider::{
    OpendalProvider, OpendalProviderConfig, Provider, ProviderHealth, ProviderRegistry, Usage,
};

use crate::archive::Archives;
use crate::cache::CacheStore;
use crate::deletion::{DeleteCoordinator, DeleteRequest, DeleteSource};
use crate::explain::{EntryExplanation, Explainer};
use crate::hydration::{HydrateOptions, HydrationController, HydrationOutcome};
use crate::placeholder::PlaceholderLayer;
use crate::planner::PlacementPlanner;
use crate::scanner::{ScanReport, Scanner};
use crate::snapshot::Snapshots;
use crate::trash::TrashBin;

pub struct Engine {
    layout: RepoLayout,
    config: CloudfsConfig,
    store: Arc<EncryptedStore>,
    index: Arc<Index>,
    journal: Arc<Journal>,
    registry: Arc<ProviderRegistry>,
    cache: Arc<CacheStore>,
    placeholders: Arc<PlaceholderLayer>,
    hydration: HydrationController,
    planner: PlacementPlanner,
    deletions: Arc<DeleteCoordinator>,
    trash: TrashBin,
    snapshots: Snapshots,
    archives: Archives,
    explainer: Explainer,
    scanner: Scanner,
    // Single writer: every mutating public operation holds this.
    write_lock: tokio::sync::Mutex<()>,
}

/// Settings for a new provider registration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub priority: i64,
    pub soft_limit: Option<i64>,
    pub hard_limit: Option<i64>,
    pub requires_encryption: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            priority: 1,
            soft_limit: None,
            hard_limit: None,
            requires_encryption: false,
        }
    }
}

#[derive(Debug)]
pub struct ProviderStatusReport {
    pub record: ProviderRecord,
    pub usage: Option<Usage>,
    pub health: ProviderHealth,
    pub placement_count: i64,
}

#[derive(Debug)]
pub struct LsItem {
    pub entry: Entry,
    pub path: String,
    pub active_version: Option<Version>,
    pub hydration: Hydration,
}

impl Engine {
    /// Create a new repository at `root` and open it.
    pub fn init(root: &Path, passphrase: Option<&str>) -> CloudfsResult<Self> {
        let layout = RepoLayout::new(root);
        if layout.is_initialized() {
            return Err(CloudfsError::AlreadyExists(format!(
                "repository at {}",
                root.display()
            )));
        }
        layout.create_dirs()?;
        {
            let store = EncryptedStore::open(&layout.index_db(), passphrase)?;
            store.with_conn(schema::bootstrap)?;
        }
        tracing::info!(root = %root.display(), "initialized repository");
        Self::open(root, passphrase)
    }

    /// Open an existing repository. Does not run recovery; `repair` is an
    /// explicit operation so the operator can inspect pending work first.
    pub fn open(root: &Path, passphrase: Option<&str>) -> CloudfsResult<Self> {
        let layout = RepoLayout::new(root);
        if !layout.is_initialized() {
            return Err(CloudfsError::not_found(format!(
                "repository at {} (run `cloudfs init` first)",
                root.display()
            )));
        }
        let config = CloudfsConfig::load(&layout.config_file())?;

        let store = Arc::new(EncryptedStore::open(&layout.index_db(), passphrase)?);
        store.with_conn(schema::bootstrap)?;

        let index = Arc::new(Index::new(Arc::clone(&store)));
        let journal = Arc::new(Journal::new(Arc::clone(&store)));
        let registry = Arc::new(ProviderRegistry::new());
        let cache = Arc::new(CacheStore::new(Arc::clone(&index), layout.cache_dir())?);
        let placeholders = Arc::new(PlaceholderLayer::new(layout.root())?);
        let deletions = Arc::new(DeleteCoordinator::new(
            Arc::clone(&index),
            Arc::clone(&journal),
            Arc::clone(&registry),
        ));

        let engine = Self {
            hydration: HydrationController::new(
                Arc::clone(&index),
                Arc::clone(&journal),
                Arc::clone(&cache),
                Arc::clone(&placeholders),
                Arc::clone(&registry),
                layout.temp_dir(),
            ),
            planner: PlacementPlanner::new(Arc::clone(&index), Arc::clone(&registry)),
            trash: TrashBin::new(
                Arc::clone(&store),
                Arc::clone(&index),
                Arc::clone(&journal),
                Arc::clone(&cache),
                Arc::clone(&placeholders),
                Arc::clone(&deletions),
            ),
            snapshots: Snapshots::new(Arc::clone(&store), Arc::clone(&journal)),
            archives: Archives::new(
                Arc::clone(&store),
                Arc::clone(&index),
                Arc::clone(&journal),
                layout.cache_dir(),
                layout.archive_dir(),
            )?,
            explainer: Explainer::new(
                Arc::clone(&store),
                Arc::clone(&index),
                Arc::clone(&journal),
                Arc::clone(&placeholders),
            ),
            scanner: Scanner::new(
                Arc::clone(&store),
                Arc::clone(&index),
                Arc::clone(&journal),
            ),
            deletions,
            cache,
            placeholders,
            registry,
            journal,
            index,
            store,
            config,
            layout,
            write_lock: tokio::sync::Mutex::new(()),
        };
        engine.load_configured_providers()?;
        Ok(engine)
    }

    /// Reconstruct provider instances from their index rows. Rows whose
    /// kind cannot be built here (e.g. test doubles) are skipped; callers
    /// re-register those after opening.
    fn load_configured_providers(&self) -> CloudfsResult<()> {
        for record in self.index.list_providers()? {
            if record.status != ProviderStatus::Active {
                continue;
            }
            match record.kind.as_str() {
                "fs" | "s3" => {
                    let get = |key: &str| self.index.provider_config_get(&record.name, key);
                    let provider = OpendalProvider::new(OpendalProviderConfig {
                        id: record.name.clone(),
                        kind: record.kind.clone(),
                        display_name: record.name.clone(),
                        root: get("root")?.unwrap_or_default(),
                        endpoint: get("endpoint")?,
                        region: get("region")?,
                        bucket: get("bucket")?,
                        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                        capacity_bytes: get("capacity")?.and_then(|v| v.parse().ok()),
                        requires_encryption: record.requires_encryption,
                    })?;
                    self.registry.register(Arc::new(provider))?;
                }
                other => {
                    tracing::warn!(
                        provider = %record.name,
                        kind = other,
                        "provider kind is not constructible here; register it manually"
                    );
                }
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    pub fn config(&self) -> &CloudfsConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<EncryptedStore> {
        &self.store
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn placeholders(&self) -> &PlaceholderLayer {
        &self.placeholders
    }

    pub fn planner(&self) -> &PlacementPlanner {
        &self.planner
    }

    pub fn deletions(&self) -> &DeleteCoordinator {
        &self.deletions
    }

    pub fn trash(&self) -> &TrashBin {
        &self.trash
    }

    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    pub fn archives(&self) -> &Archives {
        &self.archives
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    // ── Providers ────────────────────────────────────────────────────────────

    /// Register an OpenDAL-backed provider and persist its configuration.
    pub async fn add_provider(
        &self,
        config: OpendalProviderConfig,
        settings: ProviderSettings,
    ) -> CloudfsResult<ProviderRecord> {
        let _guard = self.write_lock.lock().await;

        // Build and probe the backend before any row exists.
        let provider = Arc::new(OpendalProvider::new(config.clone())?);
        provider.init().await?;

        let op = self.journal.begin(
            "provider_add",
            &serde_json::json!({ "name": config.id, "kind": config.kind }),
        )?;
        let record = self.index.create_provider(
            &op,
            &NewProvider {
                name: config.id.clone(),
                kind: config.kind.clone(),
                priority: settings.priority,
                soft_limit: settings.soft_limit,
                hard_limit: settings.hard_limit,
                capabilities: None,
                requires_encryption: settings.requires_encryption,
            },
        )?;
        self.index
            .provider_config_set(&op, &config.id, "root", &config.root)?;
        for (key, value) in [
            ("endpoint", &config.endpoint),
            ("region", &config.region),
            ("bucket", &config.bucket),
        ] {
            if let Some(value) = value {
                self.index.provider_config_set(&op, &config.id, key, value)?;
            }
        }
        if let Some(capacity) = config.capacity_bytes {
            self.index
                .provider_config_set(&op, &config.id, "capacity", &capacity.to_string())?;
        }
        self.registry.register(provider)?;
        self.journal.commit(&op)?;
        self.journal.sync(&op)?;
        Ok(record)
    }

    /// Register an already-constructed provider (mock backends, custom
    /// implementations). Persists a row so placements can reference it.
    pub async fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        settings: ProviderSettings,
    ) -> CloudfsResult<ProviderRecord> {
        let _guard = self.write_lock.lock().await;
        let name = provider.id().to_string();

        let record = match self.index.provider(&name)? {
            Some(existing) => existing,
            None => {
                let op = self.journal.begin(
                    "provider_add",
                    &serde_json::json!({ "name": name, "kind": provider.kind() }),
                )?;
                let record = self.index.create_provider(
                    &op,
                    &NewProvider {
                        name: name.clone(),
                        kind: provider.kind().to_string(),
                        priority: settings.priority,
                        soft_limit: settings.soft_limit,
                        hard_limit: settings.hard_limit,
                        capabilities: None,
                        requires_encryption: settings.requires_encryption,
                    },
                )?;
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                record
            }
        };
        self.registry.register(provider)?;
        Ok(record)
    }

    pub async fn provider_status(&self, name: &str) -> CloudfsResult<ProviderStatusReport> {
        let record = self
            .index
            .provider(name)?
            .ok_or_else(|| CloudfsError::NoProvider(name.to_string()))?;
        let placement_count = self.index.count_placements_for_provider(name)?;
        match self.registry.get(name)? {
            Some(provider) => Ok(ProviderStatusReport {
                usage: provider.usage().await.ok(),
                health: provider.check_health().await,
                record,
                placement_count,
            }),
            None => Ok(ProviderStatusReport {
                usage: None,
                health: ProviderHealth::Unavailable,
                record,
                placement_count,
            }),
        }
    }

    /// Remove a provider. With `delete_data`, its placements are first
    /// removed remotely via the delete coordinator (confirmation required);
    /// without it, removal is refused while placements reference it.
    pub async fn remove_provider(
        &self,
        name: &str,
        delete_data: bool,
        confirmed: bool,
    ) -> CloudfsResult<()> {
        let _guard = self.write_lock.lock().await;
        self.index
            .provider(name)?
            .ok_or_else(|| CloudfsError::NoProvider(name.to_string()))?;

        if delete_data {
            let targets = self.store.with_conn(|conn| {
                use cloudfs_index::SqlExt;
                let mut stmt = conn
                    .prepare(
                        "SELECT p.id, p.version_id, p.remote_path,
                                COALESCE(e.name, ''), COALESCE(v.size, 0)
                         FROM placements p
                         LEFT JOIN versions v ON p.version_id = v.id
                         LEFT JOIN entries e ON v.entry_id = e.id
                         WHERE p.provider_id = ?1",
                    )
                    .sql()?;
                let rows = stmt
                    .query_map([name], |r| {
                        Ok(crate::deletion::DeleteTarget {
                            placement_id: r.get(0)?,
                            version_id: r.get(1)?,
                            provider_id: name.to_string(),
                            remote_path: r.get(2)?,
                            entry_name: r.get(3)?,
                            size: r.get(4)?,
                        })
                    })
                    .sql()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .sql();
                rows
            })?;
            if !targets.is_empty() {
                let outcome = self
                    .deletions
                    .execute(
                        &DeleteRequest {
                            targets,
                            source: DeleteSource::ProviderRemove,
                        },
                        confirmed,
                    )
                    .await?;
                if outcome.failed > 0 {
                    return Err(CloudfsError::remote(
                        name,
                        format!("{} placement(s) could not be removed", outcome.failed),
                    ));
                }
            }
        }

        let op = self
            .journal
            .begin("provider_remove", &serde_json::json!({ "name": name }))?;
        match self.index.remove_provider(&op, name) {
            Ok(()) => {
                let _ = self.registry.unregister(name);
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    // ── Hydration ────────────────────────────────────────────────────────────

    pub async fn hydrate(
        &self,
        rel_path: &str,
        opts: &HydrateOptions,
    ) -> CloudfsResult<HydrationOutcome> {
        let _guard = self.write_lock.lock().await;
        let entry = self.resolve_file(rel_path)?;
        self.hydration.hydrate(entry.id, opts).await
    }

    pub async fn hydrate_batch(
        &self,
        rel_paths: &[String],
        opts: &HydrateOptions,
    ) -> CloudfsResult<Vec<(String, CloudfsResult<HydrationOutcome>)>> {
        let _guard = self.write_lock.lock().await;
        let mut ids = Vec::with_capacity(rel_paths.len());
        for rel_path in rel_paths {
            ids.push(self.resolve_file(rel_path)?.id);
        }
        let results = self.hydration.hydrate_batch(&ids, opts).await;
        Ok(rel_paths
            .iter()
            .cloned()
            .zip(results.into_iter().map(|(_, r)| r))
            .collect())
    }

    pub async fn dehydrate(&self, rel_path: &str) -> CloudfsResult<()> {
        let _guard = self.write_lock.lock().await;
        let entry = self.resolve_file(rel_path)?;
        self.hydration.dehydrate(entry.id).await
    }

    // ── Cache operations ─────────────────────────────────────────────────────

    pub async fn pin(&self, rel_path: &str) -> CloudfsResult<()> {
        let _guard = self.write_lock.lock().await;
        let entry = self.resolve_file(rel_path)?;
        let op = self
            .journal
            .begin("pin", &serde_json::json!({ "entry_id": entry.id }))?;
        match self.cache.pin(&op, entry.id) {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn unpin(&self, rel_path: &str) -> CloudfsResult<()> {
        let _guard = self.write_lock.lock().await;
        let entry = self.resolve_file(rel_path)?;
        let op = self
            .journal
            .begin("unpin", &serde_json::json!({ "entry_id": entry.id }))?;
        match self.cache.unpin(&op, entry.id) {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn cache_evict(&self, rel_path: &str, confirmed: bool) -> CloudfsResult<()> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let _guard = self.write_lock.lock().await;
        let entry = self.resolve_file(rel_path)?;
        let version = self
            .index
            .active_version(entry.id)?
            .ok_or(CloudfsError::NoVersion(entry.id))?;
        let op = self.journal.begin(
            "cache_evict",
            &serde_json::json!({ "entry_id": entry.id, "version_id": version.id }),
        )?;
        match self.cache.evict(&op, entry.id, version.id, true) {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn cache_clear(&self, confirmed: bool) -> CloudfsResult<usize> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let _guard = self.write_lock.lock().await;
        let op = self.journal.begin("cache_clear", &serde_json::json!({}))?;
        match self.cache.clear(&op, true) {
            Ok(count) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(count)
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    // ── Trash ────────────────────────────────────────────────────────────────

    /// Soft-delete: move an entry to trash and clean its projection files.
    pub async fn rm(&self, rel_path: &str) -> CloudfsResult<()> {
        let _guard = self.write_lock.lock().await;
        let entry = self
            .index
            .resolve_path(rel_path)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {rel_path}")))?;
        let path = self.index.entry_path(&entry)?;
        let auto_purge_days = match self.config.trash.auto_purge_days {
            0 => None,
            days => Some(days),
        };
        self.trash.move_to_trash(entry.id, &path, auto_purge_days)?;

        // Projection cleanup. The real file is only dropped when the bytes
        // are still in the cache; user data is never the single casualty of
        // a soft delete.
        let placeholder = self.placeholders.placeholder_path(&path);
        let _ = std::fs::remove_file(placeholder);
        let real = self.placeholders.real_path(&path);
        if real.exists() {
            if let Some(version) = self.index.versions_for_entry(entry.id)?.first() {
                if self.cache.get(entry.id, version.id)?.is_some() {
                    let _ = std::fs::remove_file(&real);
                }
            }
        }
        Ok(())
    }

    // ── Read-only views ──────────────────────────────────────────────────────

    pub fn ls(&self, rel_path: Option<&str>) -> CloudfsResult<Vec<LsItem>> {
        let parent = match rel_path {
            None | Some("") | Some(".") => None,
            Some(path) => {
                let entry = self
                    .index
                    .resolve_path(path)?
                    .ok_or_else(|| CloudfsError::not_found(format!("entry {path}")))?;
                if entry.kind != EntryKind::Directory {
                    return Err(CloudfsError::invalid(format!("{path} is not a directory")));
                }
                Some(entry.id)
            }
        };
        let mut items = Vec::new();
        for entry in self.index.list_entries(parent)? {
            let path = self.index.entry_path(&entry)?;
            let active_version = self.index.active_version(entry.id)?;
            let hydration = self.index.hydration(entry.id)?;
            items.push(LsItem {
                entry,
                path,
                active_version,
                hydration,
            });
        }
        Ok(items)
    }

    pub fn explain(&self, rel_path: &str) -> CloudfsResult<EntryExplanation> {
        self.explainer.explain(rel_path, &self.archives, &self.trash)
    }

    pub fn scan_index(&self) -> CloudfsResult<ScanReport> {
        self.scanner.scan_index()
    }

    pub fn scan_cache(&self) -> CloudfsResult<ScanReport> {
        self.scanner.scan_cache(&self.cache)
    }

    pub async fn scan_providers(&self) -> CloudfsResult<ScanReport> {
        self.scanner.scan_providers(&self.registry).await
    }

    pub fn overview(&self) -> CloudfsResult<dashboard::Overview> {
        dashboard::overview(&self.store, &self.cache)
    }

    pub fn validate(&self) -> CloudfsResult<Vec<String>> {
        self.index.validate()
    }

    // ── Store maintenance ────────────────────────────────────────────────────

    pub fn export_recovery_bundle(&self, bundle_dir: &Path) -> CloudfsResult<PathBuf> {
        self.store.export_recovery_bundle(bundle_dir)
    }

    pub fn change_passphrase(&self, new_passphrase: &str) -> CloudfsResult<()> {
        self.store.change_passphrase(new_passphrase)
    }

    /// Delete the whole control directory and every placeholder in the
    /// projection. Real files are left in place.
    pub async fn destroy(self, confirmed: bool) -> CloudfsResult<()> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let root = self.layout.root().to_path_buf();
        let config_dir = self.layout.config_dir();
        drop(self);

        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file() && placeholder::is_placeholder_path(entry.path()) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        std::fs::remove_dir_all(config_dir)?;
        tracing::info!(root = %root.display(), "repository destroyed");
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    pub(crate) fn resolve_file(&self, rel_path: &str) -> CloudfsResult<Entry> {
        let entry = self
            .index
            .resolve_path(rel_path)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {rel_path}")))?;
        // Entries whose versions are all deleted sit in trash and are not
        // addressable until restored.
        if entry.kind == EntryKind::File {
            let has_live_version = self
                .index
                .versions_for_entry(entry.id)?
                .iter()
                .any(|v| v.state != VersionState::Deleted);
            if !has_live_version && self.trash.get_by_path(rel_path)?.is_some() {
                return Err(CloudfsError::not_found(format!("{rel_path} is in trash")));
            }
        }
        Ok(entry)
    }
}
