//! Delete coordinator: the only path that issues remote deletes.
//!
//! Every other component that conceptually "removes" data journals an index
//! state change and, when eventual remote removal is part of the intent,
//! delegates here. Each delete is verified by a follow-up check that the
//! remote object is gone; a failed delete downgrades the placement row to
//! `degraded` and the batch continues.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use cloudfs_core::types::PlacementState;
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::{Index, Journal};
use cloudfs_provider::{Provider, ProviderRegistry};

/// Where a delete request came from, recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteSource {
    TrashPurge,
    Destroy,
    ProviderRemove,
}

impl DeleteSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteSource::TrashPurge => "trash_purge",
            DeleteSource::Destroy => "destroy",
            DeleteSource::ProviderRemove => "provider_remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteTarget {
    pub placement_id: i64,
    pub version_id: Option<i64>,
    pub provider_id: String,
    pub remote_path: String,
    pub entry_name: String,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub targets: Vec<DeleteTarget>,
    pub source: DeleteSource,
}

#[derive(Debug, Clone)]
pub struct DeleteItem {
    pub remote_path: String,
    pub provider_id: String,
    pub size: i64,
}

/// Preview of a delete request. No side effects.
#[derive(Debug, Clone)]
pub struct DeletePreview {
    pub files: Vec<DeleteItem>,
    pub total_size: i64,
    pub by_provider: HashMap<String, usize>,
    /// Cloud deletes are always irreversible.
    pub irreversible: bool,
    pub requires_confirmation: bool,
}

#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub deleted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Serialize)]
struct DeletePayload<'a> {
    source: DeleteSource,
    count: usize,
    remote_paths: Vec<&'a str>,
}

pub struct DeleteCoordinator {
    index: Arc<Index>,
    journal: Arc<Journal>,
    registry: Arc<ProviderRegistry>,
}

impl DeleteCoordinator {
    pub fn new(index: Arc<Index>, journal: Arc<Journal>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            index,
            journal,
            registry,
        }
    }

    /// Collect delete targets for every placement of an entry.
    pub fn targets_for_entry(&self, entry_id: i64) -> CloudfsResult<Vec<DeleteTarget>> {
        let entry = self
            .index
            .entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {entry_id}")))?;
        let placements = self.index.placements_for_entry(entry_id)?;
        let mut targets = Vec::with_capacity(placements.len());
        for placement in placements {
            let size = match placement.version_id {
                Some(version_id) => self
                    .index
                    .version(version_id)?
                    .map(|v| v.size)
                    .unwrap_or(0),
                None => 0,
            };
            targets.push(DeleteTarget {
                placement_id: placement.id,
                version_id: placement.version_id,
                provider_id: placement.provider_id,
                remote_path: placement.remote_path,
                entry_name: entry.name.clone(),
                size,
            });
        }
        Ok(targets)
    }

    pub fn preview(&self, request: &DeleteRequest) -> DeletePreview {
        let mut preview = DeletePreview {
            files: Vec::with_capacity(request.targets.len()),
            total_size: 0,
            by_provider: HashMap::new(),
            irreversible: true,
            requires_confirmation: true,
        };
        for target in &request.targets {
            preview.files.push(DeleteItem {
                remote_path: target.remote_path.clone(),
                provider_id: target.provider_id.clone(),
                size: target.size,
            });
            preview.total_size += target.size;
            *preview
                .by_provider
                .entry(target.provider_id.clone())
                .or_default() += 1;
        }
        preview
    }

    /// Execute the deletes. Refuses without confirmation. Partial failures
    /// are never fatal to other items in the batch.
    pub async fn execute(
        &self,
        request: &DeleteRequest,
        confirmed: bool,
    ) -> CloudfsResult<DeleteOutcome> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }

        let op = self.journal.begin(
            "delete_execute",
            &DeletePayload {
                source: request.source,
                count: request.targets.len(),
                remote_paths: request
                    .targets
                    .iter()
                    .map(|t| t.remote_path.as_str())
                    .collect(),
            },
        )?;

        let mut outcome = DeleteOutcome::default();
        for target in &request.targets {
            match self.delete_one(target).await {
                Ok(()) => {
                    self.index.delete_placement(&op, target.placement_id)?;
                    outcome.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %target.provider_id,
                        remote = %target.remote_path,
                        "remote delete failed: {e}"
                    );
                    // Downgrade, keep the row, carry on with the batch.
                    self.index.set_placement_state(
                        &op,
                        target.placement_id,
                        PlacementState::Degraded,
                    )?;
                    outcome.failed += 1;
                    outcome
                        .errors
                        .push(format!("{}: {e}", target.remote_path));
                }
            }
        }

        self.journal.commit(&op)?;
        self.journal.sync(&op)?;
        tracing::info!(
            source = request.source.as_str(),
            deleted = outcome.deleted,
            failed = outcome.failed,
            "delete batch finished"
        );
        Ok(outcome)
    }

    async fn delete_one(&self, target: &DeleteTarget) -> CloudfsResult<()> {
        let provider = self.registry.require(&target.provider_id)?;
        provider.delete(&target.remote_path).await?;

        // Deletion is only trusted once a follow-up check says the object
        // is gone.
        let report = provider.verify(&target.remote_path).await?;
        if report.is_valid {
            return Err(CloudfsError::remote(
                &target.provider_id,
                format!("{} still exists after delete", target.remote_path),
            ));
        }
        Ok(())
    }
}
