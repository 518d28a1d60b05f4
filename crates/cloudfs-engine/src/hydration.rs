//! Hydration controller: download → verify → cache → atomic swap.
//!
//! Hydration happens only on explicit request. Downloads land in a private
//! temp path, are fingerprint-checked before any filesystem change, enter
//! the cache, and only then swap the placeholder for the real file. Every
//! step runs inside one journal operation; any failure before the swap
//! reverts the hydration state to `placeholder` and rolls the operation
//! back. Batch hydration is strictly sequential so the journal narration
//! stays linear.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cloudfs_core::types::{EntryKind, HydrationState};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::{Index, Journal, OpId};
use cloudfs_provider::{ProgressFn, Provider, ProviderRegistry};

use crate::cache::CacheStore;
use crate::placeholder::{PlaceholderDescriptor, PlaceholderLayer};

/// Progress callback: (entry id, percent 0..=100).
pub type HydrationProgress = Arc<dyn Fn(i64, i64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HydrateOptions {
    /// Pin the cache entry after a successful hydration.
    pub pin_after: bool,
    pub progress: Option<HydrationProgress>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct HydrationOutcome {
    pub entry_id: i64,
    pub version_id: i64,
    pub bytes_loaded: i64,
    /// True when the entry was already hydrated at that version.
    pub already_hydrated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HydratePayload {
    pub entry_id: i64,
    pub version_id: i64,
    pub provider_id: String,
    pub remote_path: String,
    pub rel_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DehydratePayload {
    pub entry_id: i64,
    pub version_id: i64,
    pub rel_path: String,
}

pub struct HydrationController {
    index: Arc<Index>,
    journal: Arc<Journal>,
    cache: Arc<CacheStore>,
    placeholders: Arc<PlaceholderLayer>,
    registry: Arc<ProviderRegistry>,
    temp_dir: PathBuf,
    // Serializes hydration globally; keeps journal replay reasoning simple.
    lock: Mutex<()>,
}

impl HydrationController {
    pub fn new(
        index: Arc<Index>,
        journal: Arc<Journal>,
        cache: Arc<CacheStore>,
        placeholders: Arc<PlaceholderLayer>,
        registry: Arc<ProviderRegistry>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            index,
            journal,
            cache,
            placeholders,
            registry,
            temp_dir,
            lock: Mutex::new(()),
        }
    }

    pub async fn hydrate(
        &self,
        entry_id: i64,
        opts: &HydrateOptions,
    ) -> CloudfsResult<HydrationOutcome> {
        let _guard = self.lock.lock().await;
        self.hydrate_locked(entry_id, opts).await
    }

    async fn hydrate_locked(
        &self,
        entry_id: i64,
        opts: &HydrateOptions,
    ) -> CloudfsResult<HydrationOutcome> {
        if opts.cancel.is_cancelled() {
            return Err(CloudfsError::Cancelled);
        }

        let entry = self
            .index
            .entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {entry_id}")))?;
        if entry.kind == EntryKind::Directory {
            return Err(CloudfsError::Unsupported(
                "directories are not hydrated".into(),
            ));
        }

        let version = self
            .index
            .active_version(entry_id)?
            .ok_or(CloudfsError::NoVersion(entry_id))?;

        // Idempotent: already hydrated at this version is a success.
        let hydration = self.index.hydration(entry_id)?;
        if hydration.state == HydrationState::Hydrated
            && hydration.hydrated_version_id == Some(version.id)
        {
            return Ok(HydrationOutcome {
                entry_id,
                version_id: version.id,
                bytes_loaded: 0,
                already_hydrated: true,
            });
        }

        let placement = self
            .index
            .best_placement(version.id)?
            .ok_or(CloudfsError::NoPlacement(version.id))?;
        let provider = self.registry.require(&placement.provider_id)?;
        let rel_path = self.index.entry_path(&entry)?;

        let op = self.journal.begin(
            "hydrate",
            &HydratePayload {
                entry_id,
                version_id: version.id,
                provider_id: placement.provider_id.clone(),
                remote_path: placement.remote_path.clone(),
                rel_path: rel_path.clone(),
            },
        )?;

        self.index
            .set_hydration(&op, entry_id, HydrationState::Hydrating, None, 0)?;

        match self
            .download_verify_swap(&op, entry_id, &version, &placement, provider, &rel_path, opts)
            .await
        {
            Ok(bytes_loaded) => {
                self.index.set_hydration(
                    &op,
                    entry_id,
                    HydrationState::Hydrated,
                    Some(version.id),
                    100,
                )?;
                if opts.pin_after {
                    self.cache.pin(&op, entry_id)?;
                }
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(entry = entry_id, version = version.id, "hydrated");
                Ok(HydrationOutcome {
                    entry_id,
                    version_id: version.id,
                    bytes_loaded,
                    already_hydrated: false,
                })
            }
            Err(e) => {
                // Unwind: placeholder state, rolled-back journal entry.
                if let Err(revert) =
                    self.index
                        .set_hydration(&op, entry_id, HydrationState::Placeholder, None, 0)
                {
                    tracing::warn!(entry = entry_id, "failed to revert hydration state: {revert}");
                }
                if let Err(rollback) = self.journal.rollback(&op, &e.to_string()) {
                    tracing::warn!(entry = entry_id, "journal rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_verify_swap(
        &self,
        op: &OpId,
        entry_id: i64,
        version: &cloudfs_core::types::Version,
        placement: &cloudfs_core::types::Placement,
        provider: Arc<dyn Provider>,
        rel_path: &str,
        opts: &HydrateOptions,
    ) -> CloudfsResult<i64> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let temp_path = self
            .temp_dir
            .join(format!("hydrate_{entry_id}_{}_{op}", version.id));

        // Bridge provider progress into the hydration_state row and the
        // caller's callback.
        let progress_fn: Option<ProgressFn> = opts.progress.clone().map(|cb| {
            let index = Arc::clone(&self.index);
            let op = OpId::from_existing(op.as_str());
            let boxed: ProgressFn = Box::new(move |fraction: f64| {
                let percent = (fraction * 100.0).clamp(0.0, 100.0) as i64;
                cb(entry_id, percent);
                if let Err(e) =
                    index.set_hydration(&op, entry_id, HydrationState::Hydrating, None, percent)
                {
                    tracing::debug!(entry = entry_id, "progress update failed: {e}");
                }
            });
            boxed
        });

        // The download is the long suspension point; cancellation unwinds
        // to placeholder state before anything touched the projection.
        let receipt = tokio::select! {
            _ = opts.cancel.cancelled() => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(CloudfsError::Cancelled);
            }
            receipt = provider.download(&placement.remote_path, &temp_path, progress_fn.as_ref()) => {
                match receipt {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        let _ = std::fs::remove_file(&temp_path);
                        return Err(e);
                    }
                }
            }
        };

        // Fingerprint gate before any filesystem change.
        if let Some(remote_hash) = &receipt.content_hash {
            if !version.content_hash.is_empty() && remote_hash != &version.content_hash {
                let _ = std::fs::remove_file(&temp_path);
                return Err(CloudfsError::HashMismatch {
                    expected: version.content_hash.clone(),
                    actual: remote_hash.clone(),
                });
            }
        }

        if opts.cancel.is_cancelled() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CloudfsError::Cancelled);
        }

        // Past this point the remaining work is short and bounded; cancel
        // no longer interrupts it.
        let row = self.cache.put(op, entry_id, version.id, &temp_path)?;
        self.placeholders.atomic_swap(
            rel_path,
            &row.cache_path,
            &version.content_hash,
            version.size,
        )?;
        Ok(receipt.size)
    }

    /// Reverse: recreate the placeholder and drop the real file. Refused
    /// while the version has no placement — dehydrating would strand the
    /// only copy.
    pub async fn dehydrate(&self, entry_id: i64) -> CloudfsResult<()> {
        let _guard = self.lock.lock().await;

        let entry = self
            .index
            .entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {entry_id}")))?;
        let version = self
            .index
            .active_version(entry_id)?
            .ok_or(CloudfsError::NoVersion(entry_id))?;

        let placements = self.index.placements_for_version(version.id)?;
        if placements.is_empty() {
            return Err(CloudfsError::NoPlacement(version.id));
        }
        let best = self.index.best_placement(version.id)?;
        let rel_path = self.index.entry_path(&entry)?;

        let op = self.journal.begin(
            "dehydrate",
            &DehydratePayload {
                entry_id,
                version_id: version.id,
                rel_path: rel_path.clone(),
            },
        )?;

        let descriptor = PlaceholderDescriptor::for_version(
            &entry,
            &version,
            best.as_ref().map(|p| p.provider_id.clone()),
            best.as_ref().map(|p| p.remote_path.clone()),
        );
        if let Err(e) = self.placeholders.dehydrate(&rel_path, &descriptor) {
            let _ = self.journal.rollback(&op, &e.to_string());
            return Err(e);
        }

        self.index
            .set_hydration(&op, entry_id, HydrationState::Placeholder, None, 0)?;
        self.journal.commit(&op)?;
        self.journal.sync(&op)?;
        tracing::info!(entry = entry_id, "dehydrated");
        Ok(())
    }

    /// Sequential batch; entries are never hydrated concurrently. Returns
    /// one result per requested entry, in order.
    pub async fn hydrate_batch(
        &self,
        entry_ids: &[i64],
        opts: &HydrateOptions,
    ) -> Vec<(i64, CloudfsResult<HydrationOutcome>)> {
        let mut results = Vec::with_capacity(entry_ids.len());
        for &entry_id in entry_ids {
            if opts.cancel.is_cancelled() {
                results.push((entry_id, Err(CloudfsError::Cancelled)));
                continue;
            }
            results.push((entry_id, self.hydrate(entry_id, opts).await));
        }
        results
    }
}
