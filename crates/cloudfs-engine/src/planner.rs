//! Placement planner: provider selection under hard constraints.
//!
//! Quota decisions use the provider's live usage query, never the cached
//! usage column. A plan held between add and push is tentative; `revalidate`
//! re-queries free space immediately before the upload.

use std::sync::Arc;

use cloudfs_core::types::{ProviderRecord, ProviderStatus};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::Index;
use cloudfs_provider::{Provider, ProviderRegistry};

pub struct PlacementPlanner {
    index: Arc<Index>,
    registry: Arc<ProviderRegistry>,
}

#[derive(Debug, Clone)]
pub struct PlannedPlacement {
    pub provider_id: String,
    pub priority: i64,
    pub free_bytes: i64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RejectedProvider {
    pub provider_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PlacementPlan {
    pub file_name: String,
    pub file_size: i64,
    pub encrypted: bool,
    /// Priority-ordered; the first placement is the one push uses.
    pub placements: Vec<PlannedPlacement>,
    pub rejected: Vec<RejectedProvider>,
}

impl PlacementPlan {
    pub fn is_rejected(&self) -> bool {
        self.placements.is_empty()
    }
}

impl PlacementPlanner {
    pub fn new(index: Arc<Index>, registry: Arc<ProviderRegistry>) -> Self {
        Self { index, registry }
    }

    /// Effective free space: the live available figure, additionally capped
    /// by the configured hard limit when one is set.
    async fn effective_free(&self, record: &ProviderRecord) -> CloudfsResult<i64> {
        let provider = self.registry.require(&record.name)?;
        let usage = provider.usage().await?;
        let mut free = usage.available_bytes;
        if let Some(hard) = record.hard_limit {
            free = free.min((hard - usage.used_bytes).max(0));
        }
        Ok(free)
    }

    /// Build a tentative plan for a new version.
    pub async fn plan(
        &self,
        file_name: &str,
        file_size: i64,
        encrypted: bool,
    ) -> CloudfsResult<PlacementPlan> {
        let mut plan = PlacementPlan {
            file_name: file_name.to_string(),
            file_size,
            encrypted,
            placements: Vec::new(),
            rejected: Vec::new(),
        };

        let records = self.index.list_providers()?;
        // (priority, soft-limit distance, -free): lowest wins.
        let mut scored: Vec<(i64, i64, i64, PlannedPlacement)> = Vec::new();

        for record in records {
            if record.status != ProviderStatus::Active {
                plan.rejected.push(RejectedProvider {
                    provider_id: record.name.clone(),
                    reason: format!("provider is {}", record.status.as_str()),
                });
                continue;
            }

            // Hard constraint: encryption compatibility.
            if record.requires_encryption && !encrypted {
                plan.rejected.push(RejectedProvider {
                    provider_id: record.name.clone(),
                    reason: "requires encrypted content".into(),
                });
                continue;
            }

            let free = match self.effective_free(&record).await {
                Ok(free) => free,
                Err(e) => {
                    tracing::warn!(provider = %record.name, "live usage query failed: {e}");
                    plan.rejected.push(RejectedProvider {
                        provider_id: record.name.clone(),
                        reason: format!("usage query failed: {e}"),
                    });
                    continue;
                }
            };

            // Hard constraint: live free space must cover the file.
            if free < file_size {
                plan.rejected.push(RejectedProvider {
                    provider_id: record.name.clone(),
                    reason: format!("insufficient space (need {file_size}, have {free})"),
                });
                continue;
            }

            let soft_distance = match record.soft_limit {
                Some(soft) => {
                    let provider = self.registry.require(&record.name)?;
                    let used = provider.usage().await?.used_bytes;
                    (used + file_size - soft).abs()
                }
                None => i64::MAX,
            };

            let reason = if record.soft_limit.is_some() {
                "closest to soft-limit target".to_string()
            } else if record.priority == 1 {
                "primary priority".to_string()
            } else {
                format!("{free} bytes free")
            };

            scored.push((
                record.priority,
                soft_distance,
                -free,
                PlannedPlacement {
                    provider_id: record.name.clone(),
                    priority: record.priority,
                    free_bytes: free,
                    reason,
                },
            ));
        }

        scored.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        plan.placements = scored.into_iter().map(|(_, _, _, p)| p).collect();
        Ok(plan)
    }

    /// Mandatory immediately before push: re-query live free space for every
    /// selected provider and fail if any no longer has capacity.
    pub async fn revalidate(&self, plan: &mut PlacementPlan) -> CloudfsResult<()> {
        for placement in &mut plan.placements {
            let record = self
                .index
                .provider(&placement.provider_id)?
                .ok_or_else(|| CloudfsError::NoProvider(placement.provider_id.clone()))?;
            let free = self.effective_free(&record).await?;
            if free < plan.file_size {
                return Err(CloudfsError::LimitExceeded {
                    needed: plan.file_size,
                    available: free,
                });
            }
            placement.free_bytes = free;
            placement.reason = format!("revalidated: {free} bytes free");
        }
        Ok(())
    }
}
