//! Persistent content cache, keyed by (entry id, version id).
//!
//! Files live under `cache/entries/<entry>/<version>/data`; the index rows
//! are authoritative for cache state and any on-disk stray is reconcilable
//! but not trusted. Cache entries are only ever removed by explicit user
//! action or by a trash purge; there is no size- or time-based eviction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudfs_core::types::{CacheEntry, CacheState};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::{Index, OpId};

pub struct CacheStore {
    index: Arc<Index>,
    cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFilter {
    pub pinned_only: bool,
    pub stale_only: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_entries: i64,
    pub pinned_entries: i64,
    pub stale_entries: i64,
    /// Directory-walk total of the cache tree, in bytes.
    pub disk_usage: u64,
}

impl CacheStore {
    pub fn new(index: Arc<Index>, cache_dir: impl Into<PathBuf>) -> CloudfsResult<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(cache_dir.join("entries"))?;
        Ok(Self { index, cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn data_path(&self, entry_id: i64, version_id: i64) -> PathBuf {
        self.cache_dir
            .join("entries")
            .join(entry_id.to_string())
            .join(version_id.to_string())
            .join("data")
    }

    /// Move (or copy across devices) `source` into the cache and upsert the
    /// row. An existing pin survives a re-put.
    pub fn put(
        &self,
        op: &OpId,
        entry_id: i64,
        version_id: i64,
        source: &Path,
    ) -> CloudfsResult<CacheEntry> {
        let target = self.data_path(entry_id, version_id);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(source, &target).is_err() {
            // Cross-device move: copy, then drop the source.
            std::fs::copy(source, &target)?;
            std::fs::remove_file(source)?;
        }
        self.index.upsert_cache_entry(op, entry_id, version_id, &target)
    }

    /// Path to the cached content, if the row is valid and the file exists.
    /// Updates last-accessed as a side effect; a missing file yields `None`
    /// without raising.
    pub fn get(&self, entry_id: i64, version_id: i64) -> CloudfsResult<Option<PathBuf>> {
        let Some(row) = self.index.cache_entry(entry_id, version_id)? else {
            return Ok(None);
        };
        if row.state != CacheState::Valid {
            return Ok(None);
        }
        if !row.cache_path.exists() {
            tracing::warn!(
                entry = entry_id,
                version = version_id,
                "cache row valid but file missing"
            );
            return Ok(None);
        }
        self.index.touch_cache_accessed(entry_id, version_id);
        Ok(Some(row.cache_path))
    }

    /// Remove a cached version. Requires explicit confirmation and refuses
    /// pinned rows.
    pub fn evict(
        &self,
        op: &OpId,
        entry_id: i64,
        version_id: i64,
        confirmed: bool,
    ) -> CloudfsResult<()> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let Some(row) = self.index.cache_entry(entry_id, version_id)? else {
            return Ok(());
        };
        if row.pinned {
            return Err(CloudfsError::Pinned);
        }
        self.remove_files(entry_id, version_id)?;
        self.index.delete_cache_entry(op, entry_id, version_id)
    }

    /// Remove every cached version of an entry, pinned or not. Only the
    /// trash purge path uses this.
    pub fn purge_entry(&self, op: &OpId, entry_id: i64) -> CloudfsResult<usize> {
        let rows = self.index.cache_entries_for_entry(entry_id)?;
        for row in &rows {
            self.remove_files(entry_id, row.version_id)?;
            self.index.delete_cache_entry(op, entry_id, row.version_id)?;
        }
        let entry_dir = self.cache_dir.join("entries").join(entry_id.to_string());
        if entry_dir.exists() {
            let _ = std::fs::remove_dir_all(entry_dir);
        }
        Ok(rows.len())
    }

    /// Evict every unpinned row. Requires explicit confirmation.
    pub fn clear(&self, op: &OpId, confirmed: bool) -> CloudfsResult<usize> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let rows = self.index.cache_entries(false, false)?;
        let mut cleared = 0;
        for row in rows {
            if row.pinned {
                continue;
            }
            self.remove_files(row.entry_id, row.version_id)?;
            self.index
                .delete_cache_entry(op, row.entry_id, row.version_id)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    pub fn pin(&self, op: &OpId, entry_id: i64) -> CloudfsResult<()> {
        self.index.set_cache_pinned(op, entry_id, true)
    }

    pub fn unpin(&self, op: &OpId, entry_id: i64) -> CloudfsResult<()> {
        self.index.set_cache_pinned(op, entry_id, false)
    }

    pub fn list(&self, filter: CacheFilter) -> CloudfsResult<Vec<CacheEntry>> {
        self.index.cache_entries(filter.pinned_only, filter.stale_only)
    }

    /// Unpinned rows ordered by last-accessed ascending. Suggestions for the
    /// operator; nothing acts on them automatically.
    pub fn eviction_candidates(&self, limit: i64) -> CloudfsResult<Vec<CacheEntry>> {
        self.index.eviction_candidates(limit)
    }

    pub fn stats(&self) -> CloudfsResult<CacheStats> {
        let (total, pinned, stale) = self.index.cache_counts()?;
        let mut disk_usage = 0u64;
        for entry in walkdir::WalkDir::new(&self.cache_dir)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file() {
                disk_usage += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(CacheStats {
            total_entries: total,
            pinned_entries: pinned,
            stale_entries: stale,
            disk_usage,
        })
    }

    fn remove_files(&self, entry_id: i64, version_id: i64) -> CloudfsResult<()> {
        let version_dir = self
            .cache_dir
            .join("entries")
            .join(entry_id.to_string())
            .join(version_id.to_string());
        match std::fs::remove_dir_all(&version_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudfs_core::types::{EntryKind, VersionState};
    use cloudfs_index::{EncryptedStore, Journal, NewEntry, NewVersion};

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: CacheStore,
        journal: Journal,
        entry_id: i64,
        version_id: i64,
        scratch: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(EncryptedStore::open(&dir.path().join("index.db"), None).unwrap());
        store
            .with_conn(|c| cloudfs_index::schema::bootstrap(c))
            .unwrap();
        let index = Arc::new(Index::new(store.clone()));
        let journal = Journal::new(store);

        let op = journal.begin("add", &()).unwrap();
        let entry = index
            .create_entry(
                &op,
                &NewEntry {
                    parent_id: None,
                    name: "a.txt".into(),
                    kind: EntryKind::File,
                    logical_size: 11,
                    physical_size: 11,
                    classification: None,
                },
            )
            .unwrap();
        let version = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "hash".into(),
                    size: 11,
                    state: VersionState::Active,
                },
            )
            .unwrap();

        let cache = CacheStore::new(index, dir.path().join("cache")).unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        Fixture {
            _dir: dir,
            cache,
            journal,
            entry_id: entry.id,
            version_id: version.id,
            scratch,
        }
    }

    fn stage(fixture: &Fixture, bytes: &[u8]) -> PathBuf {
        let path = fixture.scratch.join("staged");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn put_get_roundtrip() {
        let f = fixture();
        let op = f.journal.begin("hydrate", &()).unwrap();
        let staged = stage(&f, b"hello world");

        let row = f.cache.put(&op, f.entry_id, f.version_id, &staged).unwrap();
        assert!(!staged.exists(), "put consumes the source");
        assert!(row.cache_path.ends_with("data"));

        let path = f.cache.get(f.entry_id, f.version_id).unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
    }

    #[test]
    fn get_with_missing_file_returns_none() {
        let f = fixture();
        let op = f.journal.begin("hydrate", &()).unwrap();
        let staged = stage(&f, b"x");
        let row = f.cache.put(&op, f.entry_id, f.version_id, &staged).unwrap();

        std::fs::remove_file(&row.cache_path).unwrap();
        assert!(f.cache.get(f.entry_id, f.version_id).unwrap().is_none());
    }

    #[test]
    fn evict_requires_confirmation_and_respects_pin() {
        let f = fixture();
        let op = f.journal.begin("cache", &()).unwrap();
        let staged = stage(&f, b"x");
        f.cache.put(&op, f.entry_id, f.version_id, &staged).unwrap();

        assert!(matches!(
            f.cache.evict(&op, f.entry_id, f.version_id, false),
            Err(CloudfsError::NeedsConfirmation)
        ));

        f.cache.pin(&op, f.entry_id).unwrap();
        assert!(matches!(
            f.cache.evict(&op, f.entry_id, f.version_id, true),
            Err(CloudfsError::Pinned)
        ));

        f.cache.unpin(&op, f.entry_id).unwrap();
        f.cache.evict(&op, f.entry_id, f.version_id, true).unwrap();
        assert!(f.cache.get(f.entry_id, f.version_id).unwrap().is_none());
        assert!(!f.cache.data_path(f.entry_id, f.version_id).exists());
    }

    #[test]
    fn stats_and_candidates() {
        let f = fixture();
        let op = f.journal.begin("cache", &()).unwrap();
        let staged = stage(&f, b"hello world");
        f.cache.put(&op, f.entry_id, f.version_id, &staged).unwrap();

        let stats = f.cache.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.pinned_entries, 0);
        assert_eq!(stats.disk_usage, 11);

        let candidates = f.cache.eviction_candidates(5).unwrap();
        assert_eq!(candidates.len(), 1);

        f.cache.pin(&op, f.entry_id).unwrap();
        assert!(f.cache.eviction_candidates(5).unwrap().is_empty());
        assert_eq!(f.cache.stats().unwrap().pinned_entries, 1);
    }

    #[test]
    fn clear_skips_pinned_rows() {
        let f = fixture();
        let op = f.journal.begin("cache", &()).unwrap();
        let staged = stage(&f, b"x");
        f.cache.put(&op, f.entry_id, f.version_id, &staged).unwrap();
        f.cache.pin(&op, f.entry_id).unwrap();

        assert!(matches!(
            f.cache.clear(&op, false),
            Err(CloudfsError::NeedsConfirmation)
        ));
        assert_eq!(f.cache.clear(&op, true).unwrap(), 0);
        assert!(f.cache.get(f.entry_id, f.version_id).unwrap().is_some());
    }
}
