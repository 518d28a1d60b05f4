//! Filesystem projection: placeholder descriptors and the atomic swap.
//!
//! The projection is derived state and never authoritative. A placeholder is
//! a small human-readable JSON descriptor with the `.cloudfs` suffix; it
//! carries no file contents. The swap to a real file verifies the cache
//! bytes first and goes through a temp sibling + rename, so a partially
//! written real file is never observable under a user-facing path.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cloudfs_core::config::{DESCRIPTOR_VERSION, PLACEHOLDER_SUFFIX};
use cloudfs_core::types::{Entry, Version};
use cloudfs_core::{clock, CloudfsError, CloudfsResult};

use crate::hashing::sha256_file;

/// Descriptor content, serialized as pretty JSON for manual recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderDescriptor {
    pub cloudfs_version: String,
    pub entry_id: i64,
    pub version_id: i64,
    pub content_hash: String,
    pub logical_size: i64,
    pub is_placeholder: bool,
    pub original_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
}

impl PlaceholderDescriptor {
    pub fn for_version(
        entry: &Entry,
        version: &Version,
        provider_id: Option<String>,
        remote_path: Option<String>,
    ) -> Self {
        Self {
            cloudfs_version: DESCRIPTOR_VERSION.to_string(),
            entry_id: entry.id,
            version_id: version.id,
            content_hash: version.content_hash.clone(),
            logical_size: version.size,
            is_placeholder: true,
            original_name: entry.name.clone(),
            created_at: clock::now(),
            provider_id,
            remote_path,
        }
    }
}

/// Append the placeholder suffix to a path.
pub fn placeholder_path_for(real: &Path) -> PathBuf {
    let mut s: OsString = real.as_os_str().to_os_string();
    s.push(PLACEHOLDER_SUFFIX);
    PathBuf::from(s)
}

/// Classification is purely by suffix; content is validated on demand.
pub fn is_placeholder_path(path: &Path) -> bool {
    path.to_string_lossy().ends_with(PLACEHOLDER_SUFFIX)
}

pub struct PlaceholderLayer {
    root: PathBuf,
}

/// One entry's worth of projection state for `sync_projection`.
pub struct ProjectionItem {
    pub rel_path: String,
    pub is_directory: bool,
    pub descriptor: Option<PlaceholderDescriptor>,
}

impl PlaceholderLayer {
    pub fn new(root: impl Into<PathBuf>) -> CloudfsResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn real_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn placeholder_path(&self, rel_path: &str) -> PathBuf {
        placeholder_path_for(&self.real_path(rel_path))
    }

    /// Write a placeholder descriptor: temp sibling, fsync, atomic rename.
    /// Parent directories are created as needed. Idempotent.
    pub fn create(&self, rel_path: &str, descriptor: &PlaceholderDescriptor) -> CloudfsResult<()> {
        let target = self.placeholder_path(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| CloudfsError::invalid(format!("descriptor: {e}")))?;

        let tmp = placeholder_path_for(&self.real_path(rel_path)).with_extension("cloudfs.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!(path = %target.display(), "placeholder written");
        Ok(())
    }

    pub fn read(&self, placeholder_path: &Path) -> CloudfsResult<PlaceholderDescriptor> {
        let raw = std::fs::read(placeholder_path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| CloudfsError::Corrupt(format!("placeholder {placeholder_path:?}: {e}")))
    }

    /// Swap a placeholder for the verified real file.
    ///
    /// The cache file is re-fingerprinted and size-checked here, immediately
    /// before the copy. On any failure the target is left as it was: either
    /// the placeholder or nothing, never a partial real file.
    pub fn atomic_swap(
        &self,
        rel_path: &str,
        cache_path: &Path,
        expected_hash: &str,
        expected_size: i64,
    ) -> CloudfsResult<()> {
        let real = self.real_path(rel_path);
        let placeholder = self.placeholder_path(rel_path);

        let meta = std::fs::metadata(cache_path)?;
        if !expected_hash.is_empty() {
            let actual = sha256_file(cache_path)?;
            if actual != expected_hash {
                return Err(CloudfsError::HashMismatch {
                    expected: expected_hash.to_string(),
                    actual,
                });
            }
        }
        if meta.len() as i64 != expected_size {
            return Err(CloudfsError::SizeMismatch {
                expected: expected_size,
                actual: meta.len() as i64,
            });
        }

        if let Some(parent) = real.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = PathBuf::from(format!("{}.cloudfs.tmp", real.display()));
        if let Err(e) = copy_and_sync(cache_path, &tmp) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp, &real) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        // Placeholder removal only after the rename has landed.
        match std::fs::remove_file(&placeholder) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %placeholder.display(), "placeholder left behind: {e}"),
        }
        tracing::debug!(path = %real.display(), "swapped placeholder for real file");
        Ok(())
    }

    /// Reverse of the swap: write the placeholder first (fsynced), then
    /// remove the real file. A crash in between leaves both present; the
    /// repair pass deletes the real file when the placeholder is present and
    /// the hydration state says `placeholder`.
    pub fn dehydrate(&self, rel_path: &str, descriptor: &PlaceholderDescriptor) -> CloudfsResult<()> {
        let real = self.real_path(rel_path);
        self.create(rel_path, descriptor)?;

        match std::fs::remove_file(&real) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %real.display(), "real file left for repair pass: {e}");
            }
        }
        tracing::debug!(path = %real.display(), "dehydrated to placeholder");
        Ok(())
    }

    /// Ensure every item has either a real file or a placeholder. Never
    /// overwrites a real file. Used by repair.
    pub fn sync_projection(&self, items: &[ProjectionItem]) -> CloudfsResult<usize> {
        let mut created = 0;
        for item in items {
            if item.is_directory {
                std::fs::create_dir_all(self.real_path(&item.rel_path))?;
                continue;
            }
            let Some(descriptor) = &item.descriptor else {
                continue;
            };
            let real = self.real_path(&item.rel_path);
            let placeholder = self.placeholder_path(&item.rel_path);
            if real.exists() || placeholder.exists() {
                continue;
            }
            self.create(&item.rel_path, descriptor)?;
            created += 1;
        }
        Ok(created)
    }

    /// Walk the projection and report what is on disk.
    pub fn list_projection(&self) -> CloudfsResult<Vec<(String, bool)>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            if rel.starts_with(".cloudfs") {
                continue;
            }
            if entry.file_type().is_dir() {
                continue;
            }
            let is_placeholder = is_placeholder_path(entry.path());
            let rel = if is_placeholder {
                rel.trim_end_matches(PLACEHOLDER_SUFFIX).to_string()
            } else {
                rel
            };
            out.push((rel, is_placeholder));
        }
        Ok(out)
    }
}

fn copy_and_sync(src: &Path, dst: &Path) -> CloudfsResult<()> {
    let mut reader = std::fs::File::open(src)?;
    let mut writer = std::fs::File::create(dst)?;
    std::io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_bytes;
    use cloudfs_core::types::{EntryKind, VersionState};

    fn entry_and_version(name: &str, bytes: &[u8]) -> (Entry, Version) {
        let entry = Entry {
            id: 1,
            parent_id: None,
            name: name.to_string(),
            kind: EntryKind::File,
            logical_size: bytes.len() as i64,
            physical_size: bytes.len() as i64,
            parity_size: 0,
            created_at: clock::now(),
            modified_at: clock::now(),
            classification: None,
        };
        let version = Version {
            id: 10,
            entry_id: 1,
            version_num: 1,
            content_hash: sha256_bytes(bytes),
            size: bytes.len() as i64,
            created_at: clock::now(),
            state: VersionState::Active,
        };
        (entry, version)
    }

    #[test]
    fn descriptor_roundtrip_has_exact_keys() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(
            &entry,
            &version,
            Some("p1".into()),
            Some("entries/1/1/a.txt".into()),
        );

        layer.create("a.txt", &descriptor).unwrap();
        let path = layer.placeholder_path("a.txt");
        assert!(path.exists());
        assert!(is_placeholder_path(&path));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        for key in [
            "cloudfs_version",
            "entry_id",
            "version_id",
            "content_hash",
            "logical_size",
            "is_placeholder",
            "original_name",
            "created_at",
            "provider_id",
            "remote_path",
        ] {
            assert!(raw.get(key).is_some(), "missing descriptor key {key}");
        }
        assert_eq!(raw["is_placeholder"], serde_json::Value::Bool(true));

        let back = layer.read(&path).unwrap();
        assert_eq!(back.entry_id, 1);
        assert_eq!(back.content_hash, version.content_hash);
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"x");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);
        layer.create("a.txt", &descriptor).unwrap();
        layer.create("a.txt", &descriptor).unwrap();
        assert!(layer.placeholder_path("a.txt").exists());
    }

    #[test]
    fn atomic_swap_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);
        layer.create("a.txt", &descriptor).unwrap();

        let cache = dir.path().join("cache_data");
        std::fs::write(&cache, b"hello world").unwrap();

        layer
            .atomic_swap("a.txt", &cache, &version.content_hash, version.size)
            .unwrap();

        let real = layer.real_path("a.txt");
        assert_eq!(std::fs::read(&real).unwrap(), b"hello world");
        assert!(!layer.placeholder_path("a.txt").exists());
    }

    #[test]
    fn swap_hash_mismatch_leaves_placeholder_and_no_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);
        layer.create("a.txt", &descriptor).unwrap();

        let cache = dir.path().join("cache_data");
        std::fs::write(&cache, b"tampered bytes!").unwrap();

        let err = layer
            .atomic_swap("a.txt", &cache, &version.content_hash, version.size)
            .unwrap_err();
        assert!(matches!(err, CloudfsError::HashMismatch { .. }));
        assert!(layer.placeholder_path("a.txt").exists());
        assert!(!layer.real_path("a.txt").exists());
    }

    #[test]
    fn swap_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);
        layer.create("a.txt", &descriptor).unwrap();

        let cache = dir.path().join("cache_data");
        std::fs::write(&cache, b"hello world").unwrap();

        let err = layer
            .atomic_swap("a.txt", &cache, &version.content_hash, version.size + 1)
            .unwrap_err();
        assert!(matches!(err, CloudfsError::SizeMismatch { .. }));
        assert!(!layer.real_path("a.txt").exists());
    }

    #[test]
    fn dehydrate_writes_placeholder_then_removes_real() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);

        std::fs::write(layer.real_path("a.txt"), b"hello world").unwrap();
        layer.dehydrate("a.txt", &descriptor).unwrap();

        assert!(!layer.real_path("a.txt").exists());
        assert!(layer.placeholder_path("a.txt").exists());
    }

    #[test]
    fn sync_projection_never_overwrites_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let layer = PlaceholderLayer::new(dir.path().join("root")).unwrap();
        let (entry, version) = entry_and_version("a.txt", b"hello world");
        let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);

        std::fs::write(layer.real_path("a.txt"), b"hello world").unwrap();
        let created = layer
            .sync_projection(&[
                ProjectionItem {
                    rel_path: "a.txt".into(),
                    is_directory: false,
                    descriptor: Some(descriptor.clone()),
                },
                ProjectionItem {
                    rel_path: "b.txt".into(),
                    is_directory: false,
                    descriptor: Some(descriptor),
                },
            ])
            .unwrap();

        assert_eq!(created, 1, "only the missing entry gets a placeholder");
        assert!(layer.real_path("a.txt").exists());
        assert!(!layer.placeholder_path("a.txt").exists());
        assert!(layer.placeholder_path("b.txt").exists());
    }
}
