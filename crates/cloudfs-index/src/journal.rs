//! Write-ahead journal.
//!
//! Every mutation the system may later have to explain is bracketed by
//! `begin` / `commit` / `sync`, with `rollback` on failure. Transitions:
//! `pending → committed → synced`, `pending → rolled_back`, and
//! `committed → rolled_back` (recovery only, when post-commit side effects
//! are known lost). `synced` and `rolled_back` are terminal.

use std::fmt;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use cloudfs_core::clock;
use cloudfs_core::types::{JournalEntry, JournalState};
use cloudfs_core::{CloudfsError, CloudfsResult};

use crate::store::{EncryptedStore, SqlExt};

/// Handle to an open journal operation. Index mutators take one so that a
/// mutation cannot be issued without a surrounding journal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpId(String);

impl OpId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild a handle from a persisted operation id (recovery only).
    pub fn from_existing(id: impl Into<String>) -> Self {
        OpId(id.into())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct Journal {
    store: Arc<EncryptedStore>,
}

impl Journal {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    /// Insert a `pending` row and return its operation id. The payload is
    /// typed at the caller and serialized only here, at the journal edge.
    pub fn begin<P: Serialize>(&self, op_type: &str, payload: &P) -> CloudfsResult<OpId> {
        let op_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(payload)
            .map_err(|e| CloudfsError::invalid(format!("journal payload: {e}")))?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO journal (operation_id, operation_type, payload, state, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![op_id, op_type, payload, clock::now_rfc3339()],
            )
            .sql()?;
            Ok(())
        })?;
        tracing::debug!(op = %op_id, op_type, "journal begin");
        Ok(OpId(op_id))
    }

    /// `pending → committed`: the index mutation happened.
    pub fn commit(&self, op: &OpId) -> CloudfsResult<()> {
        self.transition(op, JournalState::Committed, &["pending"], None)
    }

    /// `committed → synced`: all side effects are durably in place.
    pub fn sync(&self, op: &OpId) -> CloudfsResult<()> {
        self.transition(op, JournalState::Synced, &["committed"], None)
    }

    /// Mark the operation rolled back with a reason. Permitted from
    /// `pending`, and from `committed` during recovery.
    pub fn rollback(&self, op: &OpId, reason: &str) -> CloudfsResult<()> {
        tracing::warn!(op = %op, reason, "journal rollback");
        self.transition(
            op,
            JournalState::RolledBack,
            &["pending", "committed"],
            Some(reason),
        )
    }

    fn transition(
        &self,
        op: &OpId,
        to: JournalState,
        from: &[&str],
        reason: Option<&str>,
    ) -> CloudfsResult<()> {
        self.store.with_conn(|conn| {
            let placeholders = from
                .iter()
                .map(|s| format!("'{s}'"))
                .collect::<Vec<_>>()
                .join(", ");
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE journal
                         SET state = ?1, completed_at = ?2, rollback_reason = ?3
                         WHERE operation_id = ?4 AND state IN ({placeholders})"
                    ),
                    params![
                        to.as_str(),
                        if to.is_terminal() {
                            Some(clock::now_rfc3339())
                        } else {
                            None
                        },
                        reason,
                        op.as_str()
                    ],
                )
                .sql()?;
            if changed == 1 {
                return Ok(());
            }
            // Zero rows: either the operation is unknown or the transition
            // is illegal. Distinguish for the caller.
            let current: Option<String> = conn
                .query_row(
                    "SELECT state FROM journal WHERE operation_id = ?1",
                    [op.as_str()],
                    |r| r.get(0),
                )
                .optional()
                .sql()?;
            match current {
                None => Err(CloudfsError::not_found(format!("journal op {op}"))),
                Some(state) => Err(CloudfsError::Storage(format!(
                    "illegal journal transition {state} -> {}",
                    to.as_str()
                ))),
            }
        })
    }

    /// Rows that need recovery attention: `pending` and `committed`, oldest
    /// first.
    pub fn pending(&self) -> CloudfsResult<Vec<JournalEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, operation_id, operation_type, payload, state,
                            created_at, completed_at, rollback_reason
                     FROM journal WHERE state IN ('pending', 'committed')
                     ORDER BY id ASC",
                )
                .sql()?;
            let rows = stmt
                .query_map([], row_to_entry)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql()?;
            rows.into_iter().map(finish_entry).collect()
        })
    }

    pub fn operation(&self, op_id: &str) -> CloudfsResult<Option<JournalEntry>> {
        self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, operation_id, operation_type, payload, state,
                            created_at, completed_at, rollback_reason
                     FROM journal WHERE operation_id = ?1",
                    [op_id],
                    row_to_entry,
                )
                .optional()
                .sql()?;
            row.map(finish_entry).transpose()
        })
    }

    /// Most recent rows, any state. For `journal list`.
    pub fn recent(&self, limit: i64) -> CloudfsResult<Vec<JournalEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, operation_id, operation_type, payload, state,
                            created_at, completed_at, rollback_reason
                     FROM journal ORDER BY id DESC LIMIT ?1",
                )
                .sql()?;
            let rows = stmt
                .query_map([limit], row_to_entry)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql()?;
            rows.into_iter().map(finish_entry).collect()
        })
    }
}

type RawEntry = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_entry(raw: RawEntry) -> CloudfsResult<JournalEntry> {
    let (id, operation_id, operation_type, payload, state, created_at, completed_at, reason) = raw;
    Ok(JournalEntry {
        id,
        operation_id,
        operation_type,
        payload,
        state: JournalState::parse(&state)?,
        created_at: clock::parse_rfc3339(&created_at)?,
        completed_at: completed_at.as_deref().map(clock::parse_rfc3339).transpose()?,
        rollback_reason: reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[derive(Serialize)]
    struct Probe {
        entry_id: i64,
    }

    fn journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(EncryptedStore::open(&dir.path().join("index.db"), None).unwrap());
        store.with_conn(|c| schema::bootstrap(c)).unwrap();
        (dir, Journal::new(store))
    }

    #[test]
    fn full_lifecycle() {
        let (_dir, journal) = journal();
        let op = journal.begin("hydrate", &Probe { entry_id: 7 }).unwrap();

        let row = journal.operation(op.as_str()).unwrap().unwrap();
        assert_eq!(row.state, JournalState::Pending);
        assert_eq!(row.operation_type, "hydrate");
        assert!(row.payload.contains("\"entry_id\":7"));

        journal.commit(&op).unwrap();
        journal.sync(&op).unwrap();

        let row = journal.operation(op.as_str()).unwrap().unwrap();
        assert_eq!(row.state, JournalState::Synced);
        assert!(row.completed_at.is_some());
        assert!(journal.pending().unwrap().is_empty());
    }

    #[test]
    fn rollback_records_reason() {
        let (_dir, journal) = journal();
        let op = journal.begin("push", &Probe { entry_id: 1 }).unwrap();
        journal.rollback(&op, "upload failed").unwrap();

        let row = journal.operation(op.as_str()).unwrap().unwrap();
        assert_eq!(row.state, JournalState::RolledBack);
        assert_eq!(row.rollback_reason.as_deref(), Some("upload failed"));
    }

    #[test]
    fn committed_rows_are_recoverable() {
        let (_dir, journal) = journal();
        let op = journal.begin("hydrate", &Probe { entry_id: 2 }).unwrap();
        journal.commit(&op).unwrap();

        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, JournalState::Committed);

        // Recovery may roll back a committed row.
        journal.rollback(&op, "side effects lost").unwrap();
        assert!(journal.pending().unwrap().is_empty());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let (_dir, journal) = journal();
        let op = journal.begin("trash_move", &Probe { entry_id: 3 }).unwrap();
        journal.commit(&op).unwrap();
        journal.sync(&op).unwrap();

        assert!(journal.commit(&op).is_err());
        assert!(journal.sync(&op).is_err());
        assert!(journal.rollback(&op, "nope").is_err());
    }

    #[test]
    fn unknown_op_is_not_found() {
        let (_dir, journal) = journal();
        let ghost = OpId::from_existing("no-such-op");
        assert!(matches!(
            journal.commit(&ghost),
            Err(CloudfsError::NotFound(_))
        ));
        assert!(journal.operation("no-such-op").unwrap().is_none());
    }
}
