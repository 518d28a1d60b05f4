//! Typed operations over the index schema.
//!
//! One writer at a time via the store's connection lock; readers see a
//! consistent snapshot. Every mutating operation takes the [`OpId`] of an
//! open journal operation — the index never mutates outside a journaled
//! operation.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;

use cloudfs_core::clock;
use cloudfs_core::types::*;
use cloudfs_core::{CloudfsError, CloudfsResult};

use crate::journal::OpId;
use crate::store::{EncryptedStore, SqlExt};

pub struct Index {
    store: Arc<EncryptedStore>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub parent_id: Option<i64>,
    pub name: String,
    pub kind: EntryKind,
    pub logical_size: i64,
    pub physical_size: i64,
    pub classification: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewVersion {
    pub entry_id: i64,
    pub content_hash: String,
    pub size: i64,
    pub state: VersionState,
}

#[derive(Debug, Clone)]
pub struct NewPlacement {
    pub version_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub provider_id: String,
    pub remote_path: String,
    pub state: PlacementState,
}

#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub kind: String,
    pub priority: i64,
    pub soft_limit: Option<i64>,
    pub hard_limit: Option<i64>,
    pub capabilities: Option<String>,
    pub requires_encryption: bool,
}

// Row-mapping helpers. Conversion failures (bad timestamps, unknown state
// strings) surface as conversion errors and map to `Corrupt` at the edge.

fn conv_err(e: CloudfsError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

fn ts(s: String) -> rusqlite::Result<OffsetDateTime> {
    clock::parse_rfc3339(&s).map_err(conv_err)
}

fn opt_ts(s: Option<String>) -> rusqlite::Result<Option<OffsetDateTime>> {
    s.map(ts).transpose()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        kind: EntryKind::parse(&row.get::<_, String>(3)?).map_err(conv_err)?,
        logical_size: row.get(4)?,
        physical_size: row.get(5)?,
        parity_size: row.get(6)?,
        created_at: ts(row.get(7)?)?,
        modified_at: ts(row.get(8)?)?,
        classification: row.get(9)?,
    })
}

const ENTRY_COLS: &str = "id, parent_id, name, entry_kind, logical_size, physical_size, \
                          parity_size, created_at, modified_at, classification";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        version_num: row.get(2)?,
        content_hash: row.get(3)?,
        size: row.get(4)?,
        created_at: ts(row.get(5)?)?,
        state: VersionState::parse(&row.get::<_, String>(6)?).map_err(conv_err)?,
    })
}

const VERSION_COLS: &str = "id, entry_id, version_num, content_hash, size, created_at, state";

fn placement_from_row(row: &Row<'_>) -> rusqlite::Result<Placement> {
    Ok(Placement {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        version_id: row.get(2)?,
        provider_id: row.get(3)?,
        remote_path: row.get(4)?,
        uploaded_at: ts(row.get(5)?)?,
        verified_at: opt_ts(row.get(6)?)?,
        state: PlacementState::parse(&row.get::<_, String>(7)?).map_err(conv_err)?,
    })
}

const PLACEMENT_COLS: &str =
    "id, chunk_id, version_id, provider_id, remote_path, uploaded_at, verified_at, state";

fn cache_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        version_id: row.get(2)?,
        cache_path: PathBuf::from(row.get::<_, String>(3)?),
        cached_at: ts(row.get(4)?)?,
        last_accessed: ts(row.get(5)?)?,
        pinned: row.get::<_, i64>(6)? != 0,
        state: CacheState::parse(&row.get::<_, String>(7)?).map_err(conv_err)?,
    })
}

const CACHE_COLS: &str =
    "id, entry_id, version_id, cache_path, cached_at, last_accessed, pinned, state";

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        name: row.get(0)?,
        kind: row.get(1)?,
        status: ProviderStatus::parse(&row.get::<_, String>(2)?).map_err(conv_err)?,
        priority: row.get(3)?,
        soft_limit: row.get(4)?,
        hard_limit: row.get(5)?,
        current_usage: row.get(6)?,
        capabilities: row.get(7)?,
        requires_encryption: row.get::<_, i64>(8)? != 0,
        created_at: ts(row.get(9)?)?,
    })
}

const PROVIDER_COLS: &str = "name, kind, status, priority, soft_limit, hard_limit, \
                             current_usage, capabilities, requires_encryption, created_at";

impl Index {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EncryptedStore> {
        &self.store
    }

    // ── Entries ──────────────────────────────────────────────────────────────

    pub fn create_entry(&self, op: &OpId, new: &NewEntry) -> CloudfsResult<Entry> {
        if new.name.is_empty() || new.name.contains('/') {
            return Err(CloudfsError::invalid(format!("bad entry name {:?}", new.name)));
        }
        if let Some(parent_id) = new.parent_id {
            let parent = self
                .entry(parent_id)?
                .ok_or_else(|| CloudfsError::not_found(format!("parent entry {parent_id}")))?;
            if parent.kind != EntryKind::Directory {
                return Err(CloudfsError::invalid(format!(
                    "parent {} is not a directory",
                    parent.name
                )));
            }
        }
        let now = clock::now_rfc3339();
        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entries (parent_id, name, entry_kind, logical_size,
                                      physical_size, parity_size, created_at,
                                      modified_at, classification)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?7)",
                params![
                    new.parent_id,
                    new.name,
                    new.kind.as_str(),
                    new.logical_size,
                    new.physical_size,
                    now,
                    new.classification
                ],
            )
            .sql()?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(op = %op, entry = id, name = %new.name, "created entry");
        self.entry(id)?
            .ok_or_else(|| CloudfsError::Storage("entry vanished after insert".into()))
    }

    pub fn entry(&self, id: i64) -> CloudfsResult<Option<Entry>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLS} FROM entries WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn entry_by_name(&self, parent: Option<i64>, name: &str) -> CloudfsResult<Option<Entry>> {
        self.store.with_conn(|conn| {
            match parent {
                Some(parent_id) => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLS} FROM entries
                             WHERE parent_id = ?1 AND name = ?2"
                        ),
                        params![parent_id, name],
                        entry_from_row,
                    )
                    .optional(),
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLS} FROM entries
                             WHERE parent_id IS NULL AND name = ?1"
                        ),
                        params![name],
                        entry_from_row,
                    )
                    .optional(),
            }
            .sql()
        })
    }

    /// Resolve a root-relative path by walking the tree.
    pub fn resolve_path(&self, rel_path: &str) -> CloudfsResult<Option<Entry>> {
        let mut parent: Option<i64> = None;
        let mut current: Option<Entry> = None;
        for component in rel_path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            match self.entry_by_name(parent, component)? {
                Some(entry) => {
                    parent = Some(entry.id);
                    current = Some(entry);
                }
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Root-relative path of an entry, walking parents. The parent chain is
    /// a tree by construction; the hop limit guards against a corrupted one.
    pub fn entry_path(&self, entry: &Entry) -> CloudfsResult<String> {
        let mut parts = vec![entry.name.clone()];
        let mut parent = entry.parent_id;
        let mut hops = 0;
        while let Some(parent_id) = parent {
            hops += 1;
            if hops > 256 {
                return Err(CloudfsError::Corrupt(format!(
                    "parent chain too deep for entry {}",
                    entry.id
                )));
            }
            let p = self
                .entry(parent_id)?
                .ok_or_else(|| CloudfsError::Corrupt(format!("dangling parent {parent_id}")))?;
            parts.push(p.name.clone());
            parent = p.parent_id;
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    pub fn list_entries(&self, parent: Option<i64>) -> CloudfsResult<Vec<Entry>> {
        self.store.with_conn(|conn| {
            let sql = match parent {
                Some(_) => format!(
                    "SELECT {ENTRY_COLS} FROM entries WHERE parent_id = ?1
                     ORDER BY entry_kind DESC, name ASC"
                ),
                None => format!(
                    "SELECT {ENTRY_COLS} FROM entries WHERE parent_id IS NULL
                     ORDER BY entry_kind DESC, name ASC"
                ),
            };
            let mut stmt = conn.prepare(&sql).sql()?;
            let rows = match parent {
                Some(id) => stmt.query_map([id], entry_from_row),
                None => stmt.query_map([], entry_from_row),
            }
            .sql()?;
            rows.collect::<rusqlite::Result<Vec<_>>>().sql()
        })
    }

    /// All file entries, for push/scan sweeps.
    pub fn list_file_entries(&self) -> CloudfsResult<Vec<Entry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLS} FROM entries WHERE entry_kind = 'file' ORDER BY id"
                ))
                .sql()?;
            let rows = stmt
                .query_map([], entry_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    /// Name-substring search with optional kind and classification filters.
    pub fn search_entries(
        &self,
        name_contains: Option<&str>,
        kind: Option<EntryKind>,
        classification: Option<&str>,
    ) -> CloudfsResult<Vec<Entry>> {
        self.store.with_conn(|conn| {
            let mut sql = format!("SELECT {ENTRY_COLS} FROM entries WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(fragment) = name_contains {
                sql.push_str(" AND name LIKE ?");
                args.push(format!("%{fragment}%"));
            }
            if let Some(kind) = kind {
                sql.push_str(" AND entry_kind = ?");
                args.push(kind.as_str().to_string());
            }
            if let Some(class) = classification {
                sql.push_str(" AND classification = ?");
                args.push(class.to_string());
            }
            sql.push_str(" ORDER BY name ASC");
            let mut stmt = conn.prepare(&sql).sql()?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), entry_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    /// Get or create a directory entry under `parent`.
    pub fn ensure_directory(
        &self,
        op: &OpId,
        parent: Option<i64>,
        name: &str,
    ) -> CloudfsResult<Entry> {
        if let Some(existing) = self.entry_by_name(parent, name)? {
            if existing.kind != EntryKind::Directory {
                return Err(CloudfsError::AlreadyExists(format!(
                    "{name} exists and is not a directory"
                )));
            }
            return Ok(existing);
        }
        self.create_entry(
            op,
            &NewEntry {
                parent_id: parent,
                name: name.to_string(),
                kind: EntryKind::Directory,
                logical_size: 0,
                physical_size: 0,
                classification: None,
            },
        )
    }

    pub fn update_entry_sizes(
        &self,
        op: &OpId,
        id: i64,
        logical: i64,
        physical: i64,
    ) -> CloudfsResult<()> {
        tracing::debug!(op = %op, entry = id, logical, physical, "updated entry sizes");
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE entries SET logical_size = ?1, physical_size = ?2, modified_at = ?3
                 WHERE id = ?4",
                params![logical, physical, clock::now_rfc3339(), id],
            )
            .sql()?;
            Ok(())
        })
    }

    pub fn delete_entry(&self, op: &OpId, id: i64) -> CloudfsResult<()> {
        tracing::debug!(op = %op, entry = id, "deleting entry row");
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM entries WHERE id = ?1", [id]).sql()?;
            Ok(())
        })
    }

    // ── Versions ─────────────────────────────────────────────────────────────

    /// Insert the next version for an entry. `version_num` is assigned
    /// monotonically per entry.
    pub fn create_version(&self, op: &OpId, new: &NewVersion) -> CloudfsResult<Version> {
        let id = self.store.with_conn(|conn| {
            let next: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version_num), 0) + 1 FROM versions WHERE entry_id = ?1",
                    [new.entry_id],
                    |r| r.get(0),
                )
                .sql()?;
            conn.execute(
                "INSERT INTO versions (entry_id, version_num, content_hash, size, created_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.entry_id,
                    next,
                    new.content_hash,
                    new.size,
                    clock::now_rfc3339(),
                    new.state.as_str()
                ],
            )
            .sql()?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(op = %op, entry = new.entry_id, version = id, "created version");
        self.version(id)?
            .ok_or_else(|| CloudfsError::Storage("version vanished after insert".into()))
    }

    pub fn version(&self, id: i64) -> CloudfsResult<Option<Version>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {VERSION_COLS} FROM versions WHERE id = ?1"),
                [id],
                version_from_row,
            )
            .optional()
            .sql()
        })
    }

    /// The unique active version, if any. At most one exists per entry.
    pub fn active_version(&self, entry_id: i64) -> CloudfsResult<Option<Version>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {VERSION_COLS} FROM versions
                     WHERE entry_id = ?1 AND state = 'active'
                     ORDER BY version_num DESC LIMIT 1"
                ),
                [entry_id],
                version_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn versions_for_entry(&self, entry_id: i64) -> CloudfsResult<Vec<Version>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {VERSION_COLS} FROM versions WHERE entry_id = ?1
                     ORDER BY version_num DESC"
                ))
                .sql()?;
            let rows = stmt
                .query_map([entry_id], version_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn set_version_state(&self, op: &OpId, id: i64, state: VersionState) -> CloudfsResult<()> {
        tracing::debug!(op = %op, version = id, state = state.as_str(), "version state");
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE versions SET state = ?1 WHERE id = ?2",
                    params![state.as_str(), id],
                )
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::not_found(format!("version {id}")));
            }
            Ok(())
        })
    }

    /// Flip every version of an entry to `state` (trash move / restore).
    pub fn set_entry_versions_state(
        &self,
        op: &OpId,
        entry_id: i64,
        state: VersionState,
    ) -> CloudfsResult<usize> {
        tracing::debug!(op = %op, entry = entry_id, state = state.as_str(), "entry versions state");
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE versions SET state = ?1 WHERE entry_id = ?2",
                params![state.as_str(), entry_id],
            )
            .sql()
        })
    }

    // ── Chunks ───────────────────────────────────────────────────────────────

    pub fn add_chunk(
        &self,
        op: &OpId,
        version_id: i64,
        chunk_index: i64,
        chunk_hash: &str,
        size: i64,
    ) -> CloudfsResult<Chunk> {
        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chunks (version_id, chunk_index, chunk_hash, size)
                 VALUES (?1, ?2, ?3, ?4)",
                params![version_id, chunk_index, chunk_hash, size],
            )
            .sql()?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(op = %op, version = version_id, chunk = chunk_index, "added chunk");
        Ok(Chunk {
            id,
            version_id,
            chunk_index,
            chunk_hash: chunk_hash.to_string(),
            size,
        })
    }

    pub fn chunks_for_version(&self, version_id: i64) -> CloudfsResult<Vec<Chunk>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, version_id, chunk_index, chunk_hash, size
                     FROM chunks WHERE version_id = ?1 ORDER BY chunk_index",
                )
                .sql()?;
            let rows = stmt
                .query_map([version_id], |row| {
                    Ok(Chunk {
                        id: row.get(0)?,
                        version_id: row.get(1)?,
                        chunk_index: row.get(2)?,
                        chunk_hash: row.get(3)?,
                        size: row.get(4)?,
                    })
                })
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    // ── Placements ───────────────────────────────────────────────────────────

    pub fn create_placement(&self, op: &OpId, new: &NewPlacement) -> CloudfsResult<Placement> {
        if new.version_id.is_none() && new.chunk_id.is_none() {
            return Err(CloudfsError::invalid(
                "placement needs a version or a chunk",
            ));
        }
        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO placements (chunk_id, version_id, provider_id, remote_path,
                                         uploaded_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.chunk_id,
                    new.version_id,
                    new.provider_id,
                    new.remote_path,
                    clock::now_rfc3339(),
                    new.state.as_str()
                ],
            )
            .sql()?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(op = %op, placement = id, provider = %new.provider_id, "created placement");
        self.placement(id)?
            .ok_or_else(|| CloudfsError::Storage("placement vanished after insert".into()))
    }

    pub fn placement(&self, id: i64) -> CloudfsResult<Option<Placement>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PLACEMENT_COLS} FROM placements WHERE id = ?1"),
                [id],
                placement_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn placements_for_version(&self, version_id: i64) -> CloudfsResult<Vec<Placement>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PLACEMENT_COLS} FROM placements WHERE version_id = ?1 ORDER BY id"
                ))
                .sql()?;
            let rows = stmt
                .query_map([version_id], placement_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn placements_for_entry(&self, entry_id: i64) -> CloudfsResult<Vec<Placement>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM placements p
                     JOIN versions v ON p.version_id = v.id
                     WHERE v.entry_id = ?1 ORDER BY p.id",
                    PLACEMENT_COLS
                        .split(", ")
                        .map(|c| format!("p.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
                .sql()?;
            let rows = stmt
                .query_map([entry_id], placement_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    /// The placement hydration should read from: uploaded or verified,
    /// preferring the most recently verified.
    pub fn best_placement(&self, version_id: i64) -> CloudfsResult<Option<Placement>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {PLACEMENT_COLS} FROM placements
                     WHERE version_id = ?1 AND state IN ('uploaded', 'verified')
                     ORDER BY verified_at IS NULL, verified_at DESC, uploaded_at DESC
                     LIMIT 1"
                ),
                [version_id],
                placement_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn set_placement_state(
        &self,
        op: &OpId,
        id: i64,
        state: PlacementState,
    ) -> CloudfsResult<()> {
        tracing::debug!(op = %op, placement = id, state = state.as_str(), "placement state");
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE placements SET state = ?1 WHERE id = ?2",
                    params![state.as_str(), id],
                )
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::not_found(format!("placement {id}")));
            }
            Ok(())
        })
    }

    pub fn mark_placement_verified(&self, op: &OpId, id: i64) -> CloudfsResult<()> {
        tracing::debug!(op = %op, placement = id, "placement verified");
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE placements SET state = 'verified', verified_at = ?1 WHERE id = ?2",
                params![clock::now_rfc3339(), id],
            )
            .sql()?;
            Ok(())
        })
    }

    pub fn delete_placement(&self, op: &OpId, id: i64) -> CloudfsResult<()> {
        tracing::debug!(op = %op, placement = id, "deleting placement row");
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM placements WHERE id = ?1", [id]).sql()?;
            Ok(())
        })
    }

    pub fn count_placements_for_provider(&self, provider: &str) -> CloudfsResult<i64> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT count(*) FROM placements WHERE provider_id = ?1",
                [provider],
                |r| r.get(0),
            )
            .sql()
        })
    }

    // ── Providers ────────────────────────────────────────────────────────────

    pub fn create_provider(&self, op: &OpId, new: &NewProvider) -> CloudfsResult<ProviderRecord> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO providers (name, kind, status, priority, soft_limit, hard_limit,
                                        capabilities, requires_encryption, created_at)
                 VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.name,
                    new.kind,
                    new.priority,
                    new.soft_limit,
                    new.hard_limit,
                    new.capabilities,
                    new.requires_encryption as i64,
                    clock::now_rfc3339()
                ],
            )
            .sql()?;
            Ok(())
        })?;
        tracing::info!(op = %op, provider = %new.name, kind = %new.kind, "registered provider");
        self.provider(&new.name)?
            .ok_or_else(|| CloudfsError::Storage("provider vanished after insert".into()))
    }

    pub fn provider(&self, name: &str) -> CloudfsResult<Option<ProviderRecord>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PROVIDER_COLS} FROM providers WHERE name = ?1"),
                [name],
                provider_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn list_providers(&self) -> CloudfsResult<Vec<ProviderRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PROVIDER_COLS} FROM providers ORDER BY priority, name"
                ))
                .sql()?;
            let rows = stmt
                .query_map([], provider_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn set_provider_status(
        &self,
        op: &OpId,
        name: &str,
        status: ProviderStatus,
    ) -> CloudfsResult<()> {
        tracing::debug!(op = %op, provider = name, status = status.as_str(), "provider status");
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE providers SET status = ?1 WHERE name = ?2",
                    params![status.as_str(), name],
                )
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::NoProvider(name.to_string()));
            }
            Ok(())
        })
    }

    /// Refresh the cached (display-only) usage figure.
    pub fn set_cached_usage(&self, op: &OpId, name: &str, used: i64) -> CloudfsResult<()> {
        tracing::debug!(op = %op, provider = name, used, "cached usage");
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE providers SET current_usage = ?1 WHERE name = ?2",
                params![used, name],
            )
            .sql()?;
            Ok(())
        })
    }

    /// Remove a provider row. Refused while placements still reference it.
    pub fn remove_provider(&self, op: &OpId, name: &str) -> CloudfsResult<()> {
        let references = self.count_placements_for_provider(name)?;
        if references > 0 {
            return Err(CloudfsError::invalid(format!(
                "provider {name} still has {references} placement(s)"
            )));
        }
        tracing::info!(op = %op, provider = name, "removing provider");
        self.store.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM providers WHERE name = ?1", [name])
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::NoProvider(name.to_string()));
            }
            Ok(())
        })
    }

    pub fn provider_config_set(
        &self,
        op: &OpId,
        provider: &str,
        key: &str,
        value: &str,
    ) -> CloudfsResult<()> {
        tracing::debug!(op = %op, provider, key, "provider config");
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_config (provider_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(provider_id, key) DO UPDATE SET value = excluded.value",
                params![provider, key, value],
            )
            .sql()?;
            Ok(())
        })
    }

    pub fn provider_config_get(&self, provider: &str, key: &str) -> CloudfsResult<Option<String>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM provider_config WHERE provider_id = ?1 AND key = ?2",
                params![provider, key],
                |r| r.get(0),
            )
            .optional()
            .sql()
        })
    }

    pub fn provider_config_all(&self, provider: &str) -> CloudfsResult<Vec<(String, String)>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, value FROM provider_config WHERE provider_id = ?1 ORDER BY key",
                )
                .sql()?;
            let rows = stmt
                .query_map([provider], |r| Ok((r.get(0)?, r.get(1)?)))
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    // ── Cache rows ───────────────────────────────────────────────────────────

    /// Insert or refresh a cache row, preserving the pinned flag if present.
    pub fn upsert_cache_entry(
        &self,
        op: &OpId,
        entry_id: i64,
        version_id: i64,
        cache_path: &std::path::Path,
    ) -> CloudfsResult<CacheEntry> {
        let now = clock::now_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_entries (entry_id, version_id, cache_path, cached_at,
                                            last_accessed, pinned, state)
                 VALUES (?1, ?2, ?3, ?4, ?4, 0, 'valid')
                 ON CONFLICT(entry_id, version_id) DO UPDATE SET
                     cache_path = excluded.cache_path,
                     cached_at = excluded.cached_at,
                     last_accessed = excluded.last_accessed,
                     state = 'valid'",
                params![entry_id, version_id, cache_path.to_string_lossy(), now],
            )
            .sql()?;
            Ok(())
        })?;
        tracing::debug!(op = %op, entry = entry_id, version = version_id, "cache row upserted");
        self.cache_entry(entry_id, version_id)?
            .ok_or_else(|| CloudfsError::Storage("cache row vanished after upsert".into()))
    }

    pub fn cache_entry(&self, entry_id: i64, version_id: i64) -> CloudfsResult<Option<CacheEntry>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {CACHE_COLS} FROM cache_entries
                     WHERE entry_id = ?1 AND version_id = ?2"
                ),
                params![entry_id, version_id],
                cache_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn cache_entries(
        &self,
        pinned_only: bool,
        stale_only: bool,
    ) -> CloudfsResult<Vec<CacheEntry>> {
        self.store.with_conn(|conn| {
            let mut sql = format!("SELECT {CACHE_COLS} FROM cache_entries WHERE 1=1");
            if pinned_only {
                sql.push_str(" AND pinned = 1");
            }
            if stale_only {
                sql.push_str(" AND state = 'stale'");
            }
            sql.push_str(" ORDER BY last_accessed DESC");
            let mut stmt = conn.prepare(&sql).sql()?;
            let rows = stmt
                .query_map([], cache_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn cache_entries_for_entry(&self, entry_id: i64) -> CloudfsResult<Vec<CacheEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CACHE_COLS} FROM cache_entries WHERE entry_id = ?1"
                ))
                .sql()?;
            let rows = stmt
                .query_map([entry_id], cache_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn delete_cache_entry(&self, op: &OpId, entry_id: i64, version_id: i64) -> CloudfsResult<()> {
        tracing::debug!(op = %op, entry = entry_id, version = version_id, "cache row deleted");
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE entry_id = ?1 AND version_id = ?2",
                params![entry_id, version_id],
            )
            .sql()?;
            Ok(())
        })
    }

    /// Set or clear the pinned flag on every cached version of an entry.
    pub fn set_cache_pinned(&self, op: &OpId, entry_id: i64, pinned: bool) -> CloudfsResult<()> {
        tracing::debug!(op = %op, entry = entry_id, pinned, "cache pin");
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE cache_entries SET pinned = ?1 WHERE entry_id = ?2",
                    params![pinned as i64, entry_id],
                )
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::not_found(format!(
                    "entry {entry_id} is not in the cache"
                )));
            }
            Ok(())
        })
    }

    /// Read-side bookkeeping; failure here never surfaces to the caller.
    pub fn touch_cache_accessed(&self, entry_id: i64, version_id: i64) {
        let result = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE cache_entries SET last_accessed = ?1
                 WHERE entry_id = ?2 AND version_id = ?3",
                params![clock::now_rfc3339(), entry_id, version_id],
            )
            .sql()?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(entry = entry_id, "failed to touch cache row: {e}");
        }
    }

    /// Unpinned rows, least recently used first. Suggestions only; the
    /// cache never evicts on its own.
    pub fn eviction_candidates(&self, limit: i64) -> CloudfsResult<Vec<CacheEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CACHE_COLS} FROM cache_entries
                     WHERE pinned = 0 AND state != 'pending_eviction'
                     ORDER BY last_accessed ASC LIMIT ?1"
                ))
                .sql()?;
            let rows = stmt
                .query_map([limit], cache_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn cache_counts(&self) -> CloudfsResult<(i64, i64, i64)> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT count(*),
                        COALESCE(SUM(pinned), 0),
                        COALESCE(SUM(state = 'stale'), 0)
                 FROM cache_entries",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .sql()
        })
    }

    // ── Hydration state ──────────────────────────────────────────────────────

    pub fn hydration(&self, entry_id: i64) -> CloudfsResult<Hydration> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT entry_id, current_state, hydrated_version_id,
                        hydration_progress, last_hydrated
                 FROM hydration_state WHERE entry_id = ?1",
                [entry_id],
                |row| {
                    Ok(Hydration {
                        entry_id: row.get(0)?,
                        state: HydrationState::parse(&row.get::<_, String>(1)?)
                            .map_err(conv_err)?,
                        hydrated_version_id: row.get(2)?,
                        progress: row.get(3)?,
                        last_hydrated: opt_ts(row.get(4)?)?,
                    })
                },
            )
            .optional()
            .sql()
        })?;
        Ok(row.unwrap_or_else(|| Hydration::placeholder(entry_id)))
    }

    pub fn set_hydration(
        &self,
        op: &OpId,
        entry_id: i64,
        state: HydrationState,
        version_id: Option<i64>,
        progress: i64,
    ) -> CloudfsResult<()> {
        tracing::debug!(op = %op, entry = entry_id, state = state.as_str(), progress, "hydration state");
        let last_hydrated = if state == HydrationState::Hydrated {
            Some(clock::now_rfc3339())
        } else {
            None
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hydration_state (entry_id, current_state, hydrated_version_id,
                                              hydration_progress, last_hydrated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entry_id) DO UPDATE SET
                     current_state = excluded.current_state,
                     hydrated_version_id = excluded.hydrated_version_id,
                     hydration_progress = excluded.hydration_progress,
                     last_hydrated = COALESCE(excluded.last_hydrated, last_hydrated)",
                params![
                    entry_id,
                    state.as_str(),
                    version_id,
                    progress,
                    last_hydrated
                ],
            )
            .sql()?;
            Ok(())
        })
    }

    // ── Meta / validation ────────────────────────────────────────────────────

    pub fn meta_get(&self, key: &str) -> CloudfsResult<Option<String>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()
            .sql()
        })
    }

    pub fn meta_set(&self, key: &str, value: &str) -> CloudfsResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .sql()?;
            Ok(())
        })
    }

    /// Structural invariant check. Returns human-readable findings; empty
    /// means the index is consistent.
    pub fn validate(&self) -> CloudfsResult<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut findings = Vec::new();

            let orphan_versions: i64 = conn
                .query_row(
                    "SELECT count(*) FROM versions v
                     LEFT JOIN entries e ON v.entry_id = e.id WHERE e.id IS NULL",
                    [],
                    |r| r.get(0),
                )
                .sql()?;
            if orphan_versions > 0 {
                findings.push(format!("{orphan_versions} orphaned version(s)"));
            }

            let orphan_placements: i64 = conn
                .query_row(
                    "SELECT count(*) FROM placements p
                     LEFT JOIN versions v ON p.version_id = v.id
                     WHERE p.version_id IS NOT NULL AND v.id IS NULL",
                    [],
                    |r| r.get(0),
                )
                .sql()?;
            if orphan_placements > 0 {
                findings.push(format!("{orphan_placements} orphaned placement(s)"));
            }

            let orphan_cache: i64 = conn
                .query_row(
                    "SELECT count(*) FROM cache_entries c
                     LEFT JOIN versions v ON c.version_id = v.id WHERE v.id IS NULL",
                    [],
                    |r| r.get(0),
                )
                .sql()?;
            if orphan_cache > 0 {
                findings.push(format!("{orphan_cache} orphaned cache row(s)"));
            }

            let multi_active: i64 = conn
                .query_row(
                    "SELECT count(*) FROM (
                         SELECT entry_id FROM versions WHERE state = 'active'
                         GROUP BY entry_id HAVING count(*) > 1
                     )",
                    [],
                    |r| r.get(0),
                )
                .sql()?;
            if multi_active > 0 {
                findings.push(format!(
                    "{multi_active} entr(y/ies) with more than one active version"
                ));
            }

            conn.execute(
                "INSERT INTO index_meta (key, value) VALUES ('last_validated', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [clock::now_rfc3339()],
            )
            .sql()?;

            Ok(findings)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::schema;

    fn fixture() -> (tempfile::TempDir, Index, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(EncryptedStore::open(&dir.path().join("index.db"), None).unwrap());
        store.with_conn(|c| schema::bootstrap(c)).unwrap();
        (dir, Index::new(store.clone()), Journal::new(store))
    }

    fn file_entry(name: &str, size: i64) -> NewEntry {
        NewEntry {
            parent_id: None,
            name: name.to_string(),
            kind: EntryKind::File,
            logical_size: size,
            physical_size: size,
            classification: None,
        }
    }

    #[test]
    fn entry_tree_and_uniqueness() {
        let (_dir, index, journal) = fixture();
        let op = journal.begin("add", &()).unwrap();

        let docs = index.ensure_directory(&op, None, "docs").unwrap();
        let entry = index
            .create_entry(
                &op,
                &NewEntry {
                    parent_id: Some(docs.id),
                    ..file_entry("a.txt", 11)
                },
            )
            .unwrap();
        assert_eq!(index.entry_path(&entry).unwrap(), "docs/a.txt");
        assert_eq!(
            index.resolve_path("docs/a.txt").unwrap().unwrap().id,
            entry.id
        );

        // (parent, name) is unique.
        let dup = index.create_entry(
            &op,
            &NewEntry {
                parent_id: Some(docs.id),
                ..file_entry("a.txt", 4)
            },
        );
        assert!(matches!(dup, Err(CloudfsError::AlreadyExists(_))));

        // A file cannot parent children.
        let nested = index.create_entry(
            &op,
            &NewEntry {
                parent_id: Some(entry.id),
                ..file_entry("b.txt", 1)
            },
        );
        assert!(matches!(nested, Err(CloudfsError::InvalidInput(_))));
    }

    #[test]
    fn version_numbers_are_monotonic() {
        let (_dir, index, journal) = fixture();
        let op = journal.begin("add", &()).unwrap();
        let entry = index.create_entry(&op, &file_entry("v.bin", 10)).unwrap();

        let v1 = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "aa".into(),
                    size: 10,
                    state: VersionState::Active,
                },
            )
            .unwrap();
        index
            .set_version_state(&op, v1.id, VersionState::Superseded)
            .unwrap();
        let v2 = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "bb".into(),
                    size: 12,
                    state: VersionState::Active,
                },
            )
            .unwrap();

        assert_eq!(v1.version_num, 1);
        assert_eq!(v2.version_num, 2);
        assert_eq!(index.active_version(entry.id).unwrap().unwrap().id, v2.id);
    }

    #[test]
    fn best_placement_prefers_verified() {
        let (_dir, index, journal) = fixture();
        let op = journal.begin("push", &()).unwrap();
        let entry = index.create_entry(&op, &file_entry("p.bin", 5)).unwrap();
        let version = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "cc".into(),
                    size: 5,
                    state: VersionState::Active,
                },
            )
            .unwrap();

        let uploaded = index
            .create_placement(
                &op,
                &NewPlacement {
                    version_id: Some(version.id),
                    chunk_id: None,
                    provider_id: "p1".into(),
                    remote_path: "x/1".into(),
                    state: PlacementState::Uploaded,
                },
            )
            .unwrap();
        let verified = index
            .create_placement(
                &op,
                &NewPlacement {
                    version_id: Some(version.id),
                    chunk_id: None,
                    provider_id: "p2".into(),
                    remote_path: "x/2".into(),
                    state: PlacementState::Uploaded,
                },
            )
            .unwrap();
        index.mark_placement_verified(&op, verified.id).unwrap();

        let best = index.best_placement(version.id).unwrap().unwrap();
        assert_eq!(best.id, verified.id);
        assert_ne!(best.id, uploaded.id);
    }

    #[test]
    fn provider_removal_guarded_by_placements() {
        let (_dir, index, journal) = fixture();
        let op = journal.begin("provider", &()).unwrap();
        index
            .create_provider(
                &op,
                &NewProvider {
                    name: "p1".into(),
                    kind: "fs".into(),
                    priority: 1,
                    soft_limit: None,
                    hard_limit: None,
                    capabilities: None,
                    requires_encryption: false,
                },
            )
            .unwrap();

        let entry = index.create_entry(&op, &file_entry("g.bin", 2)).unwrap();
        let version = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "dd".into(),
                    size: 2,
                    state: VersionState::Active,
                },
            )
            .unwrap();
        let placement = index
            .create_placement(
                &op,
                &NewPlacement {
                    version_id: Some(version.id),
                    chunk_id: None,
                    provider_id: "p1".into(),
                    remote_path: "g".into(),
                    state: PlacementState::Uploaded,
                },
            )
            .unwrap();

        assert!(index.remove_provider(&op, "p1").is_err());
        index.delete_placement(&op, placement.id).unwrap();
        index.remove_provider(&op, "p1").unwrap();
        assert!(index.provider("p1").unwrap().is_none());
    }

    #[test]
    fn cache_rows_preserve_pin_on_upsert() {
        let (dir, index, journal) = fixture();
        let op = journal.begin("hydrate", &()).unwrap();
        let entry = index.create_entry(&op, &file_entry("c.bin", 3)).unwrap();
        let version = index
            .create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: "ee".into(),
                    size: 3,
                    state: VersionState::Active,
                },
            )
            .unwrap();

        let path = dir.path().join("data");
        index
            .upsert_cache_entry(&op, entry.id, version.id, &path)
            .unwrap();
        index.set_cache_pinned(&op, entry.id, true).unwrap();
        let row = index
            .upsert_cache_entry(&op, entry.id, version.id, &path)
            .unwrap();
        assert!(row.pinned, "re-put must not clear the pin");

        assert!(index.eviction_candidates(10).unwrap().is_empty());
        index.set_cache_pinned(&op, entry.id, false).unwrap();
        assert_eq!(index.eviction_candidates(10).unwrap().len(), 1);
    }

    #[test]
    fn hydration_defaults_to_placeholder() {
        let (_dir, index, journal) = fixture();
        let op = journal.begin("hydrate", &()).unwrap();
        let entry = index.create_entry(&op, &file_entry("h.bin", 1)).unwrap();

        let h = index.hydration(entry.id).unwrap();
        assert_eq!(h.state, HydrationState::Placeholder);
        assert_eq!(h.progress, 0);

        index
            .set_hydration(&op, entry.id, HydrationState::Hydrated, None, 100)
            .unwrap();
        let h = index.hydration(entry.id).unwrap();
        assert_eq!(h.state, HydrationState::Hydrated);
        assert!(h.last_hydrated.is_some());
    }

    #[test]
    fn validate_reports_orphans() {
        let (_dir, index, _journal) = fixture();
        assert!(index.validate().unwrap().is_empty());

        // Force an orphan by disabling foreign keys for the insert.
        index
            .store()
            .with_conn(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = OFF;
                     INSERT INTO versions (entry_id, version_num, content_hash, size,
                                           created_at, state)
                     VALUES (9999, 1, 'xx', 1, '2024-01-01T00:00:00Z', 'active');
                     PRAGMA foreign_keys = ON;",
                )
                .map_err(crate::store::map_sqlite)
            })
            .unwrap();

        let findings = index.validate().unwrap();
        assert!(findings.iter().any(|f| f.contains("orphaned version")));
    }
}
