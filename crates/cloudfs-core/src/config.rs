//! Repository configuration and on-disk layout.
//!
//! Configuration lives at `.cloudfs/config.toml` inside the repository; a
//! missing file means all-defaults. The layout paths are fixed relative to
//! the repository root and are not configurable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding the index passphrase. Presence switches the
/// store into encrypted mode at open; absence opens unencrypted.
pub const PASSPHRASE_ENV: &str = "CLOUDFS_PASSPHRASE";

/// Suffix appended to placeholder descriptor files.
pub const PLACEHOLDER_SUFFIX: &str = ".cloudfs";

/// Descriptor format tag written into every placeholder.
pub const DESCRIPTOR_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudfsConfig {
    pub trash: TrashConfig,
    pub archive: ArchiveConfig,
    pub push: PushConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrashConfig {
    /// Days before a trashed entry becomes eligible for `purge --expired`.
    /// Zero disables auto-purge eligibility entirely.
    pub auto_purge_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// PAR2 redundancy percentage for new archives.
    pub parity_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Whether pushed content is client-side encrypted. Providers that
    /// require encryption reject pushes while this is false.
    pub encrypted: bool,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self { auto_purge_days: 30 }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { parity_level: 10 }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { encrypted: false }
    }
}

impl CloudfsConfig {
    /// Load the config file if present, defaults otherwise.
    pub fn load(path: &Path) -> crate::CloudfsResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| crate::CloudfsError::InvalidInput(format!("config: {e}")))
    }
}

/// Fixed on-disk layout of a repository.
///
/// ```text
/// <root>/.cloudfs/index.db        encrypted metadata index
/// <root>/.cloudfs/config.toml     optional configuration
/// <root>/.cloudfs/cache/          persistent content cache
/// <root>/.cloudfs/temp/           scratch for ingests and downloads
/// <root>/.cloudfs/archives/       cold archives and parity sidecars
/// <root>/<path>                   real files
/// <root>/<path>.cloudfs           placeholder descriptors
/// ```
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(".cloudfs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    pub fn index_db(&self) -> PathBuf {
        self.config_dir().join("index.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir().join("cache")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.config_dir().join("temp")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.config_dir().join("archives")
    }

    /// True once `init` has created the control directory.
    pub fn is_initialized(&self) -> bool {
        self.index_db().exists()
    }

    /// Create the control directory tree.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.config_dir(),
            self.cache_dir(),
            self.temp_dir(),
            self.archive_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: CloudfsConfig = toml::from_str("").unwrap();
        assert_eq!(config.trash.auto_purge_days, 30);
        assert_eq!(config.archive.parity_level, 10);
        assert!(!config.push.encrypted);
    }

    #[test]
    fn partial_override() {
        let config: CloudfsConfig = toml::from_str(
            r#"
[trash]
auto_purge_days = 7

[push]
encrypted = true
"#,
        )
        .unwrap();
        assert_eq!(config.trash.auto_purge_days, 7);
        assert!(config.push.encrypted);
        assert_eq!(config.archive.parity_level, 10);
    }

    #[test]
    fn serialize_roundtrip() {
        let config = CloudfsConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: CloudfsConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.trash.auto_purge_days, config.trash.auto_purge_days);
    }

    #[test]
    fn layout_paths() {
        let layout = RepoLayout::new("/r");
        assert_eq!(layout.index_db(), PathBuf::from("/r/.cloudfs/index.db"));
        assert_eq!(layout.cache_dir(), PathBuf::from("/r/.cloudfs/cache"));
        assert_eq!(layout.temp_dir(), PathBuf::from("/r/.cloudfs/temp"));
        assert_eq!(layout.archive_dir(), PathBuf::from("/r/.cloudfs/archives"));
    }
}
