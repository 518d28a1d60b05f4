//! Snapshots: named immutable sets of version ids.
//!
//! Metadata-only: create links every currently-active version inside one
//! store transaction; restore rolls the active set back by flipping version
//! states, again in one transaction, and never touches cache or remote.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use cloudfs_core::types::Snapshot;
use cloudfs_core::{clock, CloudfsError, CloudfsResult};
use cloudfs_index::{EncryptedStore, Journal, SqlExt};

pub struct Snapshots {
    store: Arc<EncryptedStore>,
    journal: Arc<Journal>,
}

#[derive(Debug, Clone)]
pub struct SnapshotDetails {
    pub snapshot: Snapshot,
    pub entry_count: i64,
    pub version_count: i64,
    pub total_size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RestorePreview {
    pub entries_to_add: Vec<String>,
    pub entries_to_remove: Vec<String>,
    pub version_changes: i64,
}

#[derive(Serialize)]
struct SnapshotPayload<'a> {
    name: &'a str,
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let created_at: String = row.get(2)?;
    Ok(Snapshot {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: clock::parse_rfc3339(&created_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        description: row.get(3)?,
    })
}

impl Snapshots {
    pub fn new(store: Arc<EncryptedStore>, journal: Arc<Journal>) -> Self {
        Self { store, journal }
    }

    /// Capture every active version under a unique name.
    pub fn create(&self, name: &str, description: Option<&str>) -> CloudfsResult<Snapshot> {
        if name.is_empty() {
            return Err(CloudfsError::invalid("snapshot name must not be empty"));
        }
        let op = self
            .journal
            .begin("snapshot_create", &SnapshotPayload { name })?;

        let result = self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO snapshots (name, created_at, description) VALUES (?1, ?2, ?3)",
                params![name, clock::now_rfc3339(), description],
            )
            .sql()?;
            let snapshot_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO snapshot_versions (snapshot_id, version_id)
                 SELECT ?1, id FROM versions WHERE state = 'active'",
                [snapshot_id],
            )
            .sql()?;
            Ok(snapshot_id)
        });

        match result {
            Ok(snapshot_id) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(snapshot = name, id = snapshot_id, "snapshot created");
                self.get(name)?
                    .ok_or_else(|| CloudfsError::Storage("snapshot vanished after insert".into()))
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    pub fn list(&self) -> CloudfsResult<Vec<Snapshot>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, created_at, description FROM snapshots
                     ORDER BY created_at DESC",
                )
                .sql()?;
            let rows = stmt
                .query_map([], snapshot_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    pub fn get(&self, name: &str) -> CloudfsResult<Option<Snapshot>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at, description FROM snapshots WHERE name = ?1",
                [name],
                snapshot_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn inspect(&self, name: &str) -> CloudfsResult<SnapshotDetails> {
        let snapshot = self
            .get(name)?
            .ok_or_else(|| CloudfsError::not_found(format!("snapshot {name}")))?;
        let (entry_count, version_count, total_size) = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(DISTINCT v.entry_id), COUNT(sv.version_id), COALESCE(SUM(v.size), 0)
                 FROM snapshot_versions sv
                 JOIN versions v ON sv.version_id = v.id
                 WHERE sv.snapshot_id = ?1",
                [snapshot.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .sql()
        })?;
        Ok(SnapshotDetails {
            snapshot,
            entry_count,
            version_count,
            total_size,
        })
    }

    /// What restore would change, without changing it.
    pub fn restore_preview(&self, name: &str) -> CloudfsResult<RestorePreview> {
        let snapshot = self
            .get(name)?
            .ok_or_else(|| CloudfsError::not_found(format!("snapshot {name}")))?;

        self.store.with_conn(|conn| {
            let mut preview = RestorePreview::default();

            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT e.name
                     FROM snapshot_versions sv
                     JOIN versions v ON sv.version_id = v.id
                     JOIN entries e ON v.entry_id = e.id
                     WHERE sv.snapshot_id = ?1
                       AND e.id NOT IN (SELECT entry_id FROM versions WHERE state = 'active')",
                )
                .sql()?;
            preview.entries_to_add = stmt
                .query_map([snapshot.id], |r| r.get(0))
                .sql()?
                .collect::<rusqlite::Result<Vec<String>>>()
                .sql()?;

            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT e.name
                     FROM versions v
                     JOIN entries e ON v.entry_id = e.id
                     WHERE v.state = 'active'
                       AND v.id NOT IN
                           (SELECT version_id FROM snapshot_versions WHERE snapshot_id = ?1)",
                )
                .sql()?;
            preview.entries_to_remove = stmt
                .query_map([snapshot.id], |r| r.get(0))
                .sql()?
                .collect::<rusqlite::Result<Vec<String>>>()
                .sql()?;

            preview.version_changes = conn
                .query_row(
                    "SELECT count(*) FROM versions v
                     WHERE v.state = 'active'
                       AND v.id NOT IN
                           (SELECT version_id FROM snapshot_versions WHERE snapshot_id = ?1)",
                    [snapshot.id],
                    |r| r.get(0),
                )
                .sql()?;

            Ok(preview)
        })
    }

    /// Roll the active version set back to the snapshot. Refused while
    /// unresolved journal rows exist: a state roll over an in-flight
    /// operation could orphan its compensation.
    pub fn restore(&self, name: &str) -> CloudfsResult<()> {
        let snapshot = self
            .get(name)?
            .ok_or_else(|| CloudfsError::not_found(format!("snapshot {name}")))?;

        let unresolved = self.journal.pending()?;
        if !unresolved.is_empty() {
            return Err(CloudfsError::Busy(format!(
                "{} unresolved journal operation(s); run repair first",
                unresolved.len()
            )));
        }

        let op = self
            .journal
            .begin("snapshot_restore", &SnapshotPayload { name })?;

        let result = self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE versions SET state = 'superseded'
                 WHERE state = 'active'
                   AND id NOT IN
                       (SELECT version_id FROM snapshot_versions WHERE snapshot_id = ?1)",
                [snapshot.id],
            )
            .sql()?;
            tx.execute(
                "UPDATE versions SET state = 'active'
                 WHERE id IN (SELECT version_id FROM snapshot_versions WHERE snapshot_id = ?1)",
                [snapshot.id],
            )
            .sql()?;
            Ok(())
        });

        match result {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(snapshot = name, "restored");
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the snapshot row and its version links; the versions remain.
    pub fn delete(&self, name: &str) -> CloudfsResult<()> {
        let op = self
            .journal
            .begin("snapshot_delete", &SnapshotPayload { name })?;

        let result = self.store.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM snapshots WHERE name = ?1", [name])
                .sql()?;
            if changed == 0 {
                return Err(CloudfsError::not_found(format!("snapshot {name}")));
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }
}
