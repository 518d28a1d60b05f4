//! Startup recovery and repair.
//!
//! Recovery enumerates unresolved journal rows and resolves them without
//! ever making a mutation disappear silently:
//!
//! - `pending` rows roll back automatically; the mutation never committed.
//! - `committed` rows are resolved per operation type. Hydrate and
//!   dehydrate have purely local, checkable side effects: the swap is
//!   replayed from the cache when the verified bytes are still there,
//!   otherwise the projection reverts to a placeholder and the row rolls
//!   back with a logged reason. Rows for operations with remote side
//!   effects stay `committed` — the scanner reports them and the operator
//!   resolves them with `journal resume` or `journal rollback`.
//!
//! Repair additionally reconciles the filesystem projection: missing
//! placeholders are recreated, and a real file that coexists with a
//! placeholder while the hydration state says `placeholder` is the residue
//! of an interrupted dehydrate and is removed.

use cloudfs_core::types::{EntryKind, HydrationState, JournalState};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::OpId;
use cloudfs_provider::Provider;

use crate::hydration::{DehydratePayload, HydratePayload};
use crate::placeholder::{PlaceholderDescriptor, ProjectionItem};
use crate::Engine;

#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub operation_id: String,
    pub operation_type: String,
    pub action: String,
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub journal_actions: Vec<RecoveryAction>,
    pub placeholders_created: usize,
    pub stale_reals_removed: usize,
}

impl Engine {
    /// Resolve unresolved journal rows. Explicit: opening a repository does
    /// not run this, so the operator can inspect `journal list` first.
    pub async fn recover(&self) -> CloudfsResult<Vec<RecoveryAction>> {
        let _guard = self.write_lock().lock().await;
        self.recover_locked().await
    }

    pub(crate) async fn recover_locked(&self) -> CloudfsResult<Vec<RecoveryAction>> {
        let mut actions = Vec::new();
        for row in self.journal().pending()? {
            let op = OpId::from_existing(row.operation_id.clone());
            let action = match row.state {
                JournalState::Pending => {
                    self.revert_local_state(&row.operation_type, &row.payload)?;
                    self.journal().rollback(&op, "incomplete at startup")?;
                    "rolled back (never committed)".to_string()
                }
                JournalState::Committed => match row.operation_type.as_str() {
                    "hydrate" => self.resolve_committed_hydrate(&op, &row.payload).await?,
                    "dehydrate" => self.resolve_committed_dehydrate(&op, &row.payload)?,
                    other => {
                        tracing::warn!(
                            op = %row.operation_id,
                            op_type = other,
                            "committed operation left for operator resolution"
                        );
                        "left committed (resolve with `journal resume`)".to_string()
                    }
                },
                // pending() only returns the two states above.
                _ => continue,
            };
            tracing::info!(op = %row.operation_id, op_type = %row.operation_type, action = %action, "recovery");
            actions.push(RecoveryAction {
                operation_id: row.operation_id,
                operation_type: row.operation_type,
                action,
            });
        }
        Ok(actions)
    }

    /// Best-effort local state revert for a never-committed operation.
    fn revert_local_state(&self, op_type: &str, payload: &str) -> CloudfsResult<()> {
        if op_type == "hydrate" {
            if let Ok(parsed) = serde_json::from_str::<HydratePayload>(payload) {
                let op = self.journal().begin(
                    "recovery_revert",
                    &serde_json::json!({ "entry_id": parsed.entry_id }),
                )?;
                self.index().set_hydration(
                    &op,
                    parsed.entry_id,
                    HydrationState::Placeholder,
                    None,
                    0,
                )?;
                self.journal().commit(&op)?;
                self.journal().sync(&op)?;
            }
        }
        Ok(())
    }

    /// A committed hydrate: the index says hydrated, but durability of the
    /// side effects was never confirmed. The cache decides the direction.
    async fn resolve_committed_hydrate(&self, op: &OpId, payload: &str) -> CloudfsResult<String> {
        let parsed: HydratePayload = serde_json::from_str(payload)
            .map_err(|e| CloudfsError::Corrupt(format!("hydrate payload: {e}")))?;
        let version = self.index().version(parsed.version_id)?;

        let real = self.placeholders().real_path(&parsed.rel_path);
        if let Some(version) = &version {
            if real.exists() {
                let actual = crate::hashing::sha256_file(&real)?;
                if actual == version.content_hash {
                    // Swap landed; only the sync marker was lost.
                    self.index().set_hydration(
                        op,
                        parsed.entry_id,
                        HydrationState::Hydrated,
                        Some(version.id),
                        100,
                    )?;
                    self.journal().sync(op)?;
                    return Ok("synced (swap already durable)".to_string());
                }
                // A mismatching real file must never survive recovery.
                std::fs::remove_file(&real)?;
            }

            if let Some(cache_path) = self.cache().get(parsed.entry_id, version.id)? {
                self.placeholders().atomic_swap(
                    &parsed.rel_path,
                    &cache_path,
                    &version.content_hash,
                    version.size,
                )?;
                self.index().set_hydration(
                    op,
                    parsed.entry_id,
                    HydrationState::Hydrated,
                    Some(version.id),
                    100,
                )?;
                self.journal().sync(op)?;
                return Ok("replayed swap from cache".to_string());
            }
        }

        // Verified bytes are gone: revert to placeholder and roll back.
        self.restore_placeholder(parsed.entry_id, &parsed.rel_path)?;
        self.index()
            .set_hydration(op, parsed.entry_id, HydrationState::Placeholder, None, 0)?;
        self.journal()
            .rollback(op, "verified bytes unavailable after crash")?;
        Ok("rolled back to placeholder".to_string())
    }

    fn resolve_committed_dehydrate(&self, op: &OpId, payload: &str) -> CloudfsResult<String> {
        let parsed: DehydratePayload = serde_json::from_str(payload)
            .map_err(|e| CloudfsError::Corrupt(format!("dehydrate payload: {e}")))?;

        let real = self.placeholders().real_path(&parsed.rel_path);
        let placeholder = self.placeholders().placeholder_path(&parsed.rel_path);
        if !placeholder.exists() {
            self.restore_placeholder(parsed.entry_id, &parsed.rel_path)?;
        }
        if real.exists() {
            std::fs::remove_file(&real)?;
        }
        self.index()
            .set_hydration(op, parsed.entry_id, HydrationState::Placeholder, None, 0)?;
        self.journal().sync(op)?;
        Ok("completed dehydrate".to_string())
    }

    fn restore_placeholder(&self, entry_id: i64, rel_path: &str) -> CloudfsResult<()> {
        let Some(entry) = self.index().entry(entry_id)? else {
            return Ok(());
        };
        let Some(version) = self.index().active_version(entry_id)? else {
            return Ok(());
        };
        let best = self.index().best_placement(version.id)?;
        let descriptor = PlaceholderDescriptor::for_version(
            &entry,
            &version,
            best.as_ref().map(|p| p.provider_id.clone()),
            best.as_ref().map(|p| p.remote_path.clone()),
        );
        self.placeholders().create(rel_path, &descriptor)
    }

    /// Full repair: journal recovery plus projection reconciliation.
    pub async fn repair(&self) -> CloudfsResult<RepairReport> {
        let journal_actions = self.recover().await?;
        let _guard = self.write_lock().lock().await;
        let mut report = RepairReport {
            journal_actions,
            ..Default::default()
        };

        // Projection reconciliation for every live entry.
        let mut items = Vec::new();
        let mut interrupted_dehydrates = Vec::new();
        for entry in self.index().list_file_entries()? {
            let Some(version) = self.index().active_version(entry.id)? else {
                continue;
            };
            let rel_path = self.index().entry_path(&entry)?;
            let hydration = self.index().hydration(entry.id)?;

            let real = self.placeholders().real_path(&rel_path);
            let placeholder = self.placeholders().placeholder_path(&rel_path);
            if real.exists()
                && placeholder.exists()
                && hydration.state == HydrationState::Placeholder
            {
                // Residue of an interrupted dehydrate.
                interrupted_dehydrates.push(real);
                continue;
            }

            let best = self.index().best_placement(version.id)?;
            items.push(ProjectionItem {
                rel_path,
                is_directory: entry.kind == EntryKind::Directory,
                descriptor: Some(PlaceholderDescriptor::for_version(
                    &entry,
                    &version,
                    best.as_ref().map(|p| p.provider_id.clone()),
                    best.as_ref().map(|p| p.remote_path.clone()),
                )),
            });
        }

        for real in interrupted_dehydrates {
            tracing::info!(path = %real.display(), "removing real file left by interrupted dehydrate");
            std::fs::remove_file(&real)?;
            report.stale_reals_removed += 1;
        }
        report.placeholders_created = self.placeholders().sync_projection(&items)?;

        Ok(report)
    }

    /// Resume one committed operation by re-running its recovery logic.
    pub async fn journal_resume(&self, operation_id: &str) -> CloudfsResult<RecoveryAction> {
        let _guard = self.write_lock().lock().await;
        let row = self
            .journal()
            .operation(operation_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("journal op {operation_id}")))?;
        if row.state != JournalState::Committed && row.state != JournalState::Pending {
            return Err(CloudfsError::invalid(format!(
                "operation is {}; nothing to resume",
                row.state.as_str()
            )));
        }
        let op = OpId::from_existing(row.operation_id.clone());
        let action = match (row.state, row.operation_type.as_str()) {
            (JournalState::Pending, _) => {
                self.revert_local_state(&row.operation_type, &row.payload)?;
                self.journal().rollback(&op, "resumed: never committed")?;
                "rolled back (never committed)".to_string()
            }
            (_, "hydrate") => self.resolve_committed_hydrate(&op, &row.payload).await?,
            (_, "dehydrate") => self.resolve_committed_dehydrate(&op, &row.payload)?,
            (_, "push") => {
                // The upload may or may not have landed; verification is
                // the arbiter.
                let parsed: super::ingest::PushPayload = serde_json::from_str(&row.payload)
                    .map_err(|e| CloudfsError::Corrupt(format!("push payload: {e}")))?;
                let provider = self.registry().require(&parsed.provider_id)?;
                let report = provider.verify(&parsed.remote_path).await?;
                if report.is_valid {
                    self.journal().sync(&op)?;
                    "synced (upload verified remotely)".to_string()
                } else {
                    self.journal()
                        .rollback(&op, "remote object missing after crash")?;
                    "rolled back (upload not found remotely)".to_string()
                }
            }
            (_, other) => {
                return Err(CloudfsError::Unsupported(format!(
                    "no resume handler for {other}; use `journal rollback` if the side effects are known lost"
                )));
            }
        };
        Ok(RecoveryAction {
            operation_id: row.operation_id,
            operation_type: row.operation_type,
            action,
        })
    }

    /// Operator-driven rollback of an unresolved operation.
    pub async fn journal_rollback(&self, operation_id: &str, reason: &str) -> CloudfsResult<()> {
        let _guard = self.write_lock().lock().await;
        let row = self
            .journal()
            .operation(operation_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("journal op {operation_id}")))?;
        self.revert_local_state(&row.operation_type, &row.payload)?;
        self.journal()
            .rollback(&OpId::from_existing(row.operation_id), reason)
    }
}
