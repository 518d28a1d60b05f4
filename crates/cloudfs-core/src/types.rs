//! Domain model: the entities stored in the metadata index.
//!
//! The index is the source of truth; the filesystem projection and provider
//! state are derived views. State enums serialize as snake_case strings both
//! in JSON payloads and in index columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

use crate::error::{CloudfsError, CloudfsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "file" => Ok(EntryKind::File),
            "directory" => Ok(EntryKind::Directory),
            other => Err(CloudfsError::Corrupt(format!("bad entry kind {other:?}"))),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named node in the parent/child tree.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub kind: EntryKind,
    pub logical_size: i64,
    pub physical_size: i64,
    pub parity_size: i64,
    pub created_at: OffsetDateTime,
    pub modified_at: OffsetDateTime,
    pub classification: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Incomplete,
    Active,
    Superseded,
    Deleted,
}

impl VersionState {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionState::Incomplete => "incomplete",
            VersionState::Active => "active",
            VersionState::Superseded => "superseded",
            VersionState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "incomplete" => Ok(VersionState::Incomplete),
            "active" => Ok(VersionState::Active),
            "superseded" => Ok(VersionState::Superseded),
            "deleted" => Ok(VersionState::Deleted),
            other => Err(CloudfsError::Corrupt(format!("bad version state {other:?}"))),
        }
    }
}

/// The atomic unit of data. Immutable except for `state`.
#[derive(Debug, Clone)]
pub struct Version {
    pub id: i64,
    pub entry_id: i64,
    pub version_num: i64,
    /// SHA-256 of the logical bytes, hex-encoded.
    pub content_hash: String,
    pub size: i64,
    pub created_at: OffsetDateTime,
    pub state: VersionState,
}

/// Ordered sub-unit of a version, used for large files and archives.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub version_id: i64,
    pub chunk_index: i64,
    pub chunk_hash: String,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementState {
    Pending,
    Uploaded,
    Verified,
    Degraded,
    Failed,
}

impl PlacementState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlacementState::Pending => "pending",
            PlacementState::Uploaded => "uploaded",
            PlacementState::Verified => "verified",
            PlacementState::Degraded => "degraded",
            PlacementState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "pending" => Ok(PlacementState::Pending),
            "uploaded" => Ok(PlacementState::Uploaded),
            "verified" => Ok(PlacementState::Verified),
            "degraded" => Ok(PlacementState::Degraded),
            "failed" => Ok(PlacementState::Failed),
            other => Err(CloudfsError::Corrupt(format!(
                "bad placement state {other:?}"
            ))),
        }
    }
}

/// The fact that a chunk-or-version is stored on a provider at a remote path.
#[derive(Debug, Clone)]
pub struct Placement {
    pub id: i64,
    pub chunk_id: Option<i64>,
    pub version_id: Option<i64>,
    pub provider_id: String,
    pub remote_path: String,
    pub uploaded_at: OffsetDateTime,
    pub verified_at: Option<OffsetDateTime>,
    pub state: PlacementState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Valid,
    Stale,
    PendingEviction,
}

impl CacheState {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::Valid => "valid",
            CacheState::Stale => "stale",
            CacheState::PendingEviction => "pending_eviction",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "valid" => Ok(CacheState::Valid),
            "stale" => Ok(CacheState::Stale),
            "pending_eviction" => Ok(CacheState::PendingEviction),
            other => Err(CloudfsError::Corrupt(format!("bad cache state {other:?}"))),
        }
    }
}

/// The index row recording that a version has local content at a cache path.
/// The index, not any on-disk manifest, is the source of truth here.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub entry_id: i64,
    pub version_id: i64,
    pub cache_path: PathBuf,
    pub cached_at: OffsetDateTime,
    pub last_accessed: OffsetDateTime,
    pub pinned: bool,
    pub state: CacheState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationState {
    Placeholder,
    Hydrating,
    Hydrated,
    Partial,
}

impl HydrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            HydrationState::Placeholder => "placeholder",
            HydrationState::Hydrating => "hydrating",
            HydrationState::Hydrated => "hydrated",
            HydrationState::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "placeholder" => Ok(HydrationState::Placeholder),
            "hydrating" => Ok(HydrationState::Hydrating),
            "hydrated" => Ok(HydrationState::Hydrated),
            "partial" => Ok(HydrationState::Partial),
            other => Err(CloudfsError::Corrupt(format!(
                "bad hydration state {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hydration {
    pub entry_id: i64,
    pub state: HydrationState,
    pub hydrated_version_id: Option<i64>,
    /// 0..=100.
    pub progress: i64,
    pub last_hydrated: Option<OffsetDateTime>,
}

impl Hydration {
    /// The default row for an entry the controller has never touched.
    pub fn placeholder(entry_id: i64) -> Self {
        Self {
            entry_id,
            state: HydrationState::Placeholder,
            hydrated_version_id: None,
            progress: 0,
            last_hydrated: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    Pending,
    Committed,
    Synced,
    RolledBack,
}

impl JournalState {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalState::Pending => "pending",
            JournalState::Committed => "committed",
            JournalState::Synced => "synced",
            JournalState::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "pending" => Ok(JournalState::Pending),
            "committed" => Ok(JournalState::Committed),
            "synced" => Ok(JournalState::Synced),
            "rolled_back" => Ok(JournalState::RolledBack),
            other => Err(CloudfsError::Corrupt(format!("bad journal state {other:?}"))),
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, JournalState::Synced | JournalState::RolledBack)
    }
}

/// A write-ahead journal row. Rows in `pending` or `committed` are
/// recoverable on restart.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: i64,
    pub operation_id: String,
    pub operation_type: String,
    /// Opaque JSON; each operation type defines its own schema.
    pub payload: String,
    pub state: JournalState,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub rollback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Inactive,
    Error,
}

impl ProviderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Inactive => "inactive",
            ProviderStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "active" => Ok(ProviderStatus::Active),
            "inactive" => Ok(ProviderStatus::Inactive),
            "error" => Ok(ProviderStatus::Error),
            other => Err(CloudfsError::Corrupt(format!(
                "bad provider status {other:?}"
            ))),
        }
    }
}

/// A configured backend. `current_usage` is a cached display figure and is
/// never authoritative for quota decisions; the planner queries providers
/// live.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub name: String,
    pub kind: String,
    pub status: ProviderStatus,
    pub priority: i64,
    pub soft_limit: Option<i64>,
    pub hard_limit: Option<i64>,
    pub current_usage: i64,
    pub capabilities: Option<String>,
    pub requires_encryption: bool,
    pub created_at: OffsetDateTime,
}

/// Named immutable set of version ids captured at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: i64,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub description: Option<String>,
}

/// A soft-deleted entry pointer. While in trash, the entry row and all
/// referenced version rows still exist; the versions hold state `deleted`.
#[derive(Debug, Clone)]
pub struct TrashEntry {
    pub id: i64,
    pub original_entry_id: i64,
    pub original_path: String,
    pub deleted_at: OffsetDateTime,
    pub version_id: Option<i64>,
    pub auto_purge_after: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Active,
    Verified,
    Corrupt,
}

impl ArchiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveState::Active => "active",
            ArchiveState::Verified => "verified",
            ArchiveState::Corrupt => "corrupt",
        }
    }

    pub fn parse(s: &str) -> CloudfsResult<Self> {
        match s {
            "active" => Ok(ArchiveState::Active),
            "verified" => Ok(ArchiveState::Verified),
            "corrupt" => Ok(ArchiveState::Corrupt),
            other => Err(CloudfsError::Corrupt(format!("bad archive state {other:?}"))),
        }
    }
}

/// Record of a cold-storage bundle for a specific version: one compressed
/// artifact plus one parity sidecar.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub id: i64,
    pub entry_id: i64,
    pub archive_path: PathBuf,
    pub parity_path: PathBuf,
    pub original_size: i64,
    pub archive_size: i64,
    /// SHA-256 over the source, computed before compression.
    pub content_hash: String,
    pub parity_level: i64,
    pub state: ArchiveState,
    pub created_at: OffsetDateTime,
    pub verified_at: Option<OffsetDateTime>,
}
