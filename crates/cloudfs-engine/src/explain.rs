//! Explainer: read-only, side-effect-free aggregation of everything the
//! index knows about one entry — versions, locations, cache, archive,
//! health, pending operations, trash state.

use std::path::PathBuf;
use std::sync::Arc;

use time::OffsetDateTime;

use cloudfs_core::types::{CacheState, Entry, JournalState, Version};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::{EncryptedStore, Index, Journal};

use crate::archive::Archives;
use crate::health::{self, EntryHealth};
use crate::placeholder::PlaceholderLayer;
use crate::trash::TrashBin;

#[derive(Debug, Clone)]
pub struct LocationInfo {
    /// "placeholder", "local", "cache", or "provider".
    pub location_type: String,
    pub path: String,
    pub provider_id: Option<String>,
    pub verified: bool,
    pub last_verified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct CacheStateInfo {
    pub is_cached: bool,
    pub cache_path: Option<PathBuf>,
    pub pinned: bool,
    pub last_accessed: Option<OffsetDateTime>,
    pub state: Option<CacheState>,
}

#[derive(Debug, Clone)]
pub struct TrashStateInfo {
    pub deleted_at: OffsetDateTime,
    pub auto_purge_after: Option<OffsetDateTime>,
    pub days_in_trash: i64,
}

#[derive(Debug, Clone)]
pub struct PendingOpInfo {
    pub operation_id: String,
    pub operation_type: String,
    pub state: JournalState,
}

#[derive(Debug)]
pub struct EntryExplanation {
    pub entry: Entry,
    pub path: String,
    pub active_version: Option<Version>,
    pub version_history: Vec<Version>,
    pub hydration_state: String,
    pub locations: Vec<LocationInfo>,
    pub cache: CacheStateInfo,
    pub archive: Option<cloudfs_core::types::ArchiveRecord>,
    pub health: EntryHealth,
    pub pending_ops: Vec<PendingOpInfo>,
    pub trash: Option<TrashStateInfo>,
}

pub struct Explainer {
    store: Arc<EncryptedStore>,
    index: Arc<Index>,
    journal: Arc<Journal>,
    placeholders: Arc<PlaceholderLayer>,
}

impl Explainer {
    pub fn new(
        store: Arc<EncryptedStore>,
        index: Arc<Index>,
        journal: Arc<Journal>,
        placeholders: Arc<PlaceholderLayer>,
    ) -> Self {
        Self {
            store,
            index,
            journal,
            placeholders,
        }
    }

    pub fn explain(
        &self,
        rel_path: &str,
        archives: &Archives,
        trash: &TrashBin,
    ) -> CloudfsResult<EntryExplanation> {
        let entry = self
            .index
            .resolve_path(rel_path)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {rel_path}")))?;
        let path = self.index.entry_path(&entry)?;

        let active_version = self.index.active_version(entry.id)?;
        let version_history = self.index.versions_for_entry(entry.id)?;
        let hydration = self.index.hydration(entry.id)?;

        let mut locations = Vec::new();
        let placeholder_path = self.placeholders.placeholder_path(&path);
        if placeholder_path.exists() {
            locations.push(LocationInfo {
                location_type: "placeholder".into(),
                path: placeholder_path.to_string_lossy().into_owned(),
                provider_id: None,
                verified: false,
                last_verified: None,
            });
        }
        let real_path = self.placeholders.real_path(&path);
        if real_path.exists() {
            locations.push(LocationInfo {
                location_type: "local".into(),
                path: real_path.to_string_lossy().into_owned(),
                provider_id: None,
                verified: false,
                last_verified: None,
            });
        }

        let mut cache_info = CacheStateInfo {
            is_cached: false,
            cache_path: None,
            pinned: false,
            last_accessed: None,
            state: None,
        };
        if let Some(version) = &active_version {
            if let Some(row) = self.index.cache_entry(entry.id, version.id)? {
                if row.cache_path.exists() {
                    locations.push(LocationInfo {
                        location_type: "cache".into(),
                        path: row.cache_path.to_string_lossy().into_owned(),
                        provider_id: None,
                        verified: false,
                        last_verified: None,
                    });
                }
                cache_info = CacheStateInfo {
                    is_cached: true,
                    cache_path: Some(row.cache_path),
                    pinned: row.pinned,
                    last_accessed: Some(row.last_accessed),
                    state: Some(row.state),
                };
            }
        }

        for placement in self.index.placements_for_entry(entry.id)? {
            locations.push(LocationInfo {
                location_type: "provider".into(),
                path: placement.remote_path,
                provider_id: Some(placement.provider_id),
                verified: placement.verified_at.is_some(),
                last_verified: placement.verified_at,
            });
        }

        let needle = format!("\"entry_id\":{}", entry.id);
        let pending_ops = self
            .journal
            .pending()?
            .into_iter()
            .filter(|row| row.payload.contains(&needle))
            .map(|row| PendingOpInfo {
                operation_id: row.operation_id,
                operation_type: row.operation_type,
                state: row.state,
            })
            .collect();

        let trash_state = trash.get_by_path(&path)?.map(|info| TrashStateInfo {
            deleted_at: info.entry.deleted_at,
            auto_purge_after: info.entry.auto_purge_after,
            days_in_trash: info.days_in_trash,
        });

        Ok(EntryExplanation {
            health: health::entry_health(&self.store, entry.id)?,
            archive: archives.latest_for_entry(entry.id)?,
            hydration_state: hydration.state.as_str().to_string(),
            entry,
            path,
            active_version,
            version_history,
            locations,
            cache: cache_info,
            pending_ops,
            trash: trash_state,
        })
    }
}
