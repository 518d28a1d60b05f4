//! Trash: the soft-delete gate.
//!
//! Moving to trash is an index-only state change: the trash row points at
//! the entry, every version flips to `deleted`, and neither cache nor
//! remote is touched. Purging is where data actually leaves the system —
//! remote removal is delegated to the delete coordinator before any local
//! row goes away.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use cloudfs_core::types::{TrashEntry, VersionState};
use cloudfs_core::{clock, CloudfsError, CloudfsResult};
use cloudfs_index::{map_sqlite, EncryptedStore, Index, Journal, SqlExt};

use crate::cache::CacheStore;
use crate::deletion::{DeleteCoordinator, DeleteRequest, DeleteSource};
use crate::placeholder::PlaceholderLayer;

pub struct TrashBin {
    store: Arc<EncryptedStore>,
    index: Arc<Index>,
    journal: Arc<Journal>,
    cache: Arc<CacheStore>,
    placeholders: Arc<PlaceholderLayer>,
    deletions: Arc<DeleteCoordinator>,
}

#[derive(Debug, Clone)]
pub struct TrashInfo {
    pub entry: TrashEntry,
    pub size: i64,
    pub days_in_trash: i64,
}

#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub purged: usize,
    pub remote_deleted: usize,
    pub remote_failed: usize,
    pub errors: Vec<String>,
}

#[derive(Serialize)]
struct TrashMovePayload<'a> {
    entry_id: i64,
    original_path: &'a str,
}

#[derive(Serialize)]
struct TrashRestorePayload {
    trash_id: i64,
    entry_id: i64,
}

#[derive(Serialize)]
struct TrashPurgePayload<'a> {
    trash_id: i64,
    entry_id: i64,
    original_path: &'a str,
}

fn trash_from_row(row: &Row<'_>) -> rusqlite::Result<(TrashEntry, i64)> {
    let deleted_at: String = row.get(3)?;
    let auto_purge: Option<String> = row.get(5)?;
    let conv = |e: CloudfsError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok((
        TrashEntry {
            id: row.get(0)?,
            original_entry_id: row.get(1)?,
            original_path: row.get(2)?,
            deleted_at: clock::parse_rfc3339(&deleted_at).map_err(conv)?,
            version_id: row.get(4)?,
            auto_purge_after: auto_purge
                .as_deref()
                .map(clock::parse_rfc3339)
                .transpose()
                .map_err(conv)?,
        },
        row.get(6)?,
    ))
}

const TRASH_COLS: &str = "t.id, t.original_entry_id, t.original_path, t.deleted_at, \
                          t.version_id, t.auto_purge_after, COALESCE(v.size, 0)";

impl TrashBin {
    pub fn new(
        store: Arc<EncryptedStore>,
        index: Arc<Index>,
        journal: Arc<Journal>,
        cache: Arc<CacheStore>,
        placeholders: Arc<PlaceholderLayer>,
        deletions: Arc<DeleteCoordinator>,
    ) -> Self {
        Self {
            store,
            index,
            journal,
            cache,
            placeholders,
            deletions,
        }
    }

    /// Soft-delete an entry. Does not touch cache or remote.
    pub fn move_to_trash(
        &self,
        entry_id: i64,
        original_path: &str,
        auto_purge_days: Option<u32>,
    ) -> CloudfsResult<TrashEntry> {
        let op = self.journal.begin(
            "trash_move",
            &TrashMovePayload {
                entry_id,
                original_path,
            },
        )?;

        let result = (|| {
            let version_id = self.index.active_version(entry_id)?.map(|v| v.id);
            let auto_purge_after = auto_purge_days.filter(|d| *d > 0).map(|days| {
                clock::to_rfc3339(clock::now() + Duration::days(i64::from(days)))
            });

            let trash_id = self.store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trash (original_entry_id, original_path, deleted_at,
                                        version_id, auto_purge_after)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entry_id,
                        original_path,
                        clock::now_rfc3339(),
                        version_id,
                        auto_purge_after
                    ],
                )
                .sql()?;
                Ok(conn.last_insert_rowid())
            })?;

            self.index
                .set_entry_versions_state(&op, entry_id, VersionState::Deleted)?;
            Ok(trash_id)
        })();

        match result {
            Ok(trash_id) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(entry = entry_id, trash = trash_id, "moved to trash");
                self.get(trash_id)?
                    .map(|info| info.entry)
                    .ok_or_else(|| CloudfsError::Storage("trash row vanished".into()))
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    pub fn list(&self) -> CloudfsResult<Vec<TrashInfo>> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TRASH_COLS} FROM trash t
                     LEFT JOIN versions v ON t.version_id = v.id
                     ORDER BY t.deleted_at DESC"
                ))
                .sql()?;
            stmt.query_map([], trash_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql()
        })?;
        Ok(rows
            .into_iter()
            .map(|(entry, size)| {
                let days_in_trash = clock::days_since(entry.deleted_at);
                TrashInfo {
                    entry,
                    size,
                    days_in_trash,
                }
            })
            .collect())
    }

    pub fn get(&self, trash_id: i64) -> CloudfsResult<Option<TrashInfo>> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TRASH_COLS} FROM trash t
                     LEFT JOIN versions v ON t.version_id = v.id
                     WHERE t.id = ?1"
                ),
                [trash_id],
                trash_from_row,
            )
            .optional()
            .sql()
        })?;
        Ok(row.map(|(entry, size)| {
            let days_in_trash = clock::days_since(entry.deleted_at);
            TrashInfo {
                entry,
                size,
                days_in_trash,
            }
        }))
    }

    pub fn get_by_path(&self, original_path: &str) -> CloudfsResult<Option<TrashInfo>> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TRASH_COLS} FROM trash t
                     LEFT JOIN versions v ON t.version_id = v.id
                     WHERE t.original_path = ?1
                     ORDER BY t.deleted_at DESC LIMIT 1"
                ),
                [original_path],
                trash_from_row,
            )
            .optional()
            .sql()
        })?;
        Ok(row.map(|(entry, size)| {
            let days_in_trash = clock::days_since(entry.deleted_at);
            TrashInfo {
                entry,
                size,
                days_in_trash,
            }
        }))
    }

    /// Flip the referenced version back to `active` and drop the trash row.
    pub fn restore(&self, trash_id: i64) -> CloudfsResult<TrashEntry> {
        let info = self
            .get(trash_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("trash entry {trash_id}")))?;

        let op = self.journal.begin(
            "trash_restore",
            &TrashRestorePayload {
                trash_id,
                entry_id: info.entry.original_entry_id,
            },
        )?;

        let result = (|| {
            if let Some(version_id) = info.entry.version_id {
                self.index
                    .set_version_state(&op, version_id, VersionState::Active)?;
            }
            self.store.with_conn(|conn| {
                conn.execute("DELETE FROM trash WHERE id = ?1", [trash_id]).sql()?;
                Ok(())
            })
        })();

        match result {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(trash = trash_id, entry = info.entry.original_entry_id, "restored");
                Ok(info.entry)
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    /// Permanently delete one trash row. Remote removal happens first via
    /// the delete coordinator; the local rows go away only after the remote
    /// delete returned cleanly. Any remote failure leaves the entry and
    /// trash rows in place (with the failed placements downgraded) so the
    /// purge can be retried.
    pub async fn purge(&self, trash_id: i64, confirmed: bool) -> CloudfsResult<PurgeOutcome> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let info = self
            .get(trash_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("trash entry {trash_id}")))?;
        let mut outcome = PurgeOutcome::default();
        self.purge_row(&info, &mut outcome).await?;
        Ok(outcome)
    }

    pub async fn purge_all(&self, confirmed: bool) -> CloudfsResult<PurgeOutcome> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let rows = self.list()?;
        let mut outcome = PurgeOutcome::default();
        for info in rows {
            if let Err(e) = self.purge_row(&info, &mut outcome).await {
                outcome.errors.push(format!("{}: {e}", info.entry.original_path));
            }
        }
        Ok(outcome)
    }

    /// Purge rows whose auto-purge deadline has passed. Strictly an
    /// explicit operator action; nothing calls this on its own.
    pub async fn purge_expired(&self, confirmed: bool) -> CloudfsResult<PurgeOutcome> {
        if !confirmed {
            return Err(CloudfsError::NeedsConfirmation);
        }
        let now = clock::now();
        let rows: Vec<TrashInfo> = self
            .list()?
            .into_iter()
            .filter(|info| expired(info.entry.auto_purge_after, now))
            .collect();
        let mut outcome = PurgeOutcome::default();
        for info in rows {
            if let Err(e) = self.purge_row(&info, &mut outcome).await {
                outcome.errors.push(format!("{}: {e}", info.entry.original_path));
            }
        }
        Ok(outcome)
    }

    async fn purge_row(&self, info: &TrashInfo, outcome: &mut PurgeOutcome) -> CloudfsResult<()> {
        let entry_id = info.entry.original_entry_id;
        let targets = self.deletions.targets_for_entry(entry_id).unwrap_or_default();

        // Remote removal first, via the only component allowed to delete.
        if !targets.is_empty() {
            let result = self
                .deletions
                .execute(
                    &DeleteRequest {
                        targets,
                        source: DeleteSource::TrashPurge,
                    },
                    true,
                )
                .await?;
            outcome.remote_deleted += result.deleted;
            outcome.remote_failed += result.failed;
            if result.failed > 0 {
                // Keep the entry and trash rows so the purge can be retried;
                // the failed placements are already downgraded.
                outcome.errors.extend(result.errors);
                tracing::warn!(
                    entry = entry_id,
                    failed = result.failed,
                    "purge kept local rows after remote failures"
                );
                return Ok(());
            }
        }

        let op = self.journal.begin(
            "trash_purge",
            &TrashPurgePayload {
                trash_id: info.entry.id,
                entry_id,
                original_path: &info.entry.original_path,
            },
        )?;

        let result = (|| {
            self.cache.purge_entry(&op, entry_id)?;
            let placeholder = self.placeholders.placeholder_path(&info.entry.original_path);
            let _ = std::fs::remove_file(placeholder);
            self.store.with_conn(|conn| {
                conn.execute("DELETE FROM trash WHERE id = ?1", [info.entry.id])
                    .map_err(map_sqlite)?;
                Ok(())
            })?;
            self.index.delete_entry(&op, entry_id)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                outcome.purged += 1;
                tracing::info!(entry = entry_id, path = %info.entry.original_path, "purged");
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }
}

fn expired(auto_purge_after: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    matches!(auto_purge_after, Some(deadline) if deadline <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_check() {
        let now = clock::now();
        assert!(!expired(None, now));
        assert!(!expired(Some(now + Duration::days(1)), now));
        assert!(expired(Some(now - Duration::days(1)), now));
    }
}
