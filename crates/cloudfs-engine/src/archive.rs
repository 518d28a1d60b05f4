//! Cold archives: one compressed bundle plus one parity sidecar per
//! version, produced by external `7z` and `par2` tools.
//!
//! Creation never removes the source, even on failure. Restore extracts
//! into the cache, verifies the fingerprint computed over the source before
//! compression, and preserves the archive artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tokio::process::Command;

use cloudfs_core::types::{ArchiveRecord, ArchiveState};
use cloudfs_core::{clock, CloudfsError, CloudfsResult};
use cloudfs_index::{EncryptedStore, Index, Journal, SqlExt};

use crate::hashing::sha256_file;

pub struct Archives {
    store: Arc<EncryptedStore>,
    index: Arc<Index>,
    journal: Arc<Journal>,
    cache_dir: PathBuf,
    archive_dir: PathBuf,
}

#[derive(Serialize)]
struct ArchiveCreatePayload<'a> {
    entry_id: i64,
    source_path: &'a str,
    parity_level: u32,
}

#[derive(Serialize)]
struct ArchiveRestorePayload<'a> {
    entry_id: i64,
    archive_path: &'a str,
}

fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    let conv = |e: CloudfsError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };
    let created_at: String = row.get(9)?;
    let verified_at: Option<String> = row.get(10)?;
    Ok(ArchiveRecord {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        archive_path: PathBuf::from(row.get::<_, String>(2)?),
        parity_path: PathBuf::from(row.get::<_, String>(3)?),
        original_size: row.get(4)?,
        archive_size: row.get(5)?,
        content_hash: row.get(6)?,
        parity_level: row.get(7)?,
        state: ArchiveState::parse(&row.get::<_, String>(8)?).map_err(conv)?,
        created_at: clock::parse_rfc3339(&created_at).map_err(conv)?,
        verified_at: verified_at
            .as_deref()
            .map(clock::parse_rfc3339)
            .transpose()
            .map_err(conv)?,
    })
}

const ARCHIVE_COLS: &str = "id, entry_id, archive_path, parity_path, original_size, \
                            archive_size, content_hash, parity_level, state, created_at, \
                            verified_at";

/// Run an external tool, mapping a missing binary to `Unsupported`.
async fn run_tool(program: &str, args: &[&str]) -> CloudfsResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CloudfsError::Unsupported(format!("{program} not found in PATH"))
            } else {
                CloudfsError::Io(e)
            }
        })?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(CloudfsError::Storage(format!(
            "{program} exited {}: {}",
            output.status,
            combined.trim()
        )));
    }
    Ok(combined)
}

impl Archives {
    pub fn new(
        store: Arc<EncryptedStore>,
        index: Arc<Index>,
        journal: Arc<Journal>,
        cache_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
    ) -> CloudfsResult<Self> {
        let archive_dir = archive_dir.into();
        std::fs::create_dir_all(&archive_dir)?;
        Ok(Self {
            store,
            index,
            journal,
            cache_dir: cache_dir.into(),
            archive_dir,
        })
    }

    /// Compress + parity-protect a source file and record the bundle. The
    /// source is read, hashed, and otherwise left alone — also on failure.
    pub async fn create(
        &self,
        entry_id: i64,
        source_path: &Path,
        parity_level: u32,
    ) -> CloudfsResult<ArchiveRecord> {
        let entry = self
            .index
            .entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("entry {entry_id}")))?;

        let op = self.journal.begin(
            "archive_create",
            &ArchiveCreatePayload {
                entry_id,
                source_path: &source_path.to_string_lossy(),
                parity_level,
            },
        )?;

        match self
            .create_artifacts(entry_id, source_path, parity_level)
            .await
        {
            Ok(record_id) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                tracing::info!(entry = entry_id, name = %entry.name, "archived");
                self.record(record_id)?
                    .ok_or_else(|| CloudfsError::Storage("archive row vanished".into()))
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    async fn create_artifacts(
        &self,
        entry_id: i64,
        source_path: &Path,
        parity_level: u32,
    ) -> CloudfsResult<i64> {
        let source_meta = std::fs::metadata(source_path)?;
        let content_hash = sha256_file(source_path)?;

        let archive_path = self
            .archive_dir
            .join(format!("archive_{entry_id}_{}.7z", content_hash.get(..12).unwrap_or("x")));
        let parity_path = PathBuf::from(format!("{}.par2", archive_path.display()));

        run_tool(
            "7z",
            &[
                "a",
                "-t7z",
                "-mx=9",
                &archive_path.to_string_lossy(),
                &source_path.to_string_lossy(),
            ],
        )
        .await?;
        let archive_meta = std::fs::metadata(&archive_path)?;

        let parity_flag = format!("-r{parity_level}");
        if let Err(e) = run_tool(
            "par2",
            &[
                "create",
                &parity_flag,
                "-n1",
                &parity_path.to_string_lossy(),
                &archive_path.to_string_lossy(),
            ],
        )
        .await
        {
            // Parity failed: drop the half-made bundle, keep the source.
            let _ = std::fs::remove_file(&archive_path);
            return Err(e);
        }

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO archives (entry_id, archive_path, parity_path, original_size,
                                       archive_size, content_hash, parity_level, state,
                                       created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)",
                params![
                    entry_id,
                    archive_path.to_string_lossy(),
                    parity_path.to_string_lossy(),
                    source_meta.len() as i64,
                    archive_meta.len() as i64,
                    content_hash,
                    i64::from(parity_level),
                    clock::now_rfc3339()
                ],
            )
            .sql()?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn record(&self, id: i64) -> CloudfsResult<Option<ArchiveRecord>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ARCHIVE_COLS} FROM archives WHERE id = ?1"),
                [id],
                archive_from_row,
            )
            .optional()
            .sql()
        })
    }

    /// Latest archive for an entry.
    pub fn latest_for_entry(&self, entry_id: i64) -> CloudfsResult<Option<ArchiveRecord>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ARCHIVE_COLS} FROM archives WHERE entry_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [entry_id],
                archive_from_row,
            )
            .optional()
            .sql()
        })
    }

    pub fn list(&self) -> CloudfsResult<Vec<ArchiveRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ARCHIVE_COLS} FROM archives ORDER BY created_at DESC, id DESC"
                ))
                .sql()?;
            let rows = stmt
                .query_map([], archive_from_row)
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    /// Extract the latest archive for an entry into the cache tree, verify
    /// the fingerprint, and return the extracted path. Archive artifacts
    /// are preserved.
    pub async fn restore(&self, entry_id: i64) -> CloudfsResult<PathBuf> {
        let record = self
            .latest_for_entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("no archive for entry {entry_id}")))?;
        if !record.archive_path.exists() {
            return Err(CloudfsError::not_found(format!(
                "archive file {}",
                record.archive_path.display()
            )));
        }

        let op = self.journal.begin(
            "archive_restore",
            &ArchiveRestorePayload {
                entry_id,
                archive_path: &record.archive_path.to_string_lossy(),
            },
        )?;

        match self.restore_artifacts(&record).await {
            Ok(path) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(path)
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    async fn restore_artifacts(&self, record: &ArchiveRecord) -> CloudfsResult<PathBuf> {
        // Parity check first; attempt a repair before giving up.
        if record.parity_path.exists() {
            if let Err(verify_err) =
                run_tool("par2", &["verify", &record.parity_path.to_string_lossy()]).await
            {
                tracing::warn!(
                    archive = %record.archive_path.display(),
                    "parity verify failed, attempting repair: {verify_err}"
                );
                run_tool("par2", &["repair", &record.parity_path.to_string_lossy()]).await?;
            }
        }

        let restore_dir = self
            .cache_dir
            .join("entries")
            .join(record.entry_id.to_string())
            .join("restore");
        std::fs::create_dir_all(&restore_dir)?;

        let out_flag = format!("-o{}", restore_dir.display());
        run_tool(
            "7z",
            &[
                "x",
                "-y",
                &out_flag,
                &record.archive_path.to_string_lossy(),
            ],
        )
        .await?;

        let extracted = walkdir::WalkDir::new(&restore_dir)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .ok_or_else(|| CloudfsError::Storage("nothing extracted from archive".into()))?;

        let actual = sha256_file(&extracted)?;
        if actual != record.content_hash {
            let _ = std::fs::remove_file(&extracted);
            return Err(CloudfsError::HashMismatch {
                expected: record.content_hash.clone(),
                actual,
            });
        }
        Ok(extracted)
    }

    /// Run the parity verification tool and record the result.
    pub async fn verify(&self, entry_id: i64) -> CloudfsResult<ArchiveState> {
        let record = self
            .latest_for_entry(entry_id)?
            .ok_or_else(|| CloudfsError::not_found(format!("no archive for entry {entry_id}")))?;

        let op = self.journal.begin(
            "archive_verify",
            &ArchiveRestorePayload {
                entry_id,
                archive_path: &record.archive_path.to_string_lossy(),
            },
        )?;

        let state = match run_tool("par2", &["verify", &record.parity_path.to_string_lossy()]).await
        {
            Ok(_) => ArchiveState::Verified,
            Err(CloudfsError::Unsupported(message)) => {
                let _ = self.journal.rollback(&op, &message);
                return Err(CloudfsError::Unsupported(message));
            }
            Err(e) => {
                tracing::warn!(entry = entry_id, "archive verification failed: {e}");
                ArchiveState::Corrupt
            }
        };

        let result = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE archives SET state = ?1, verified_at = ?2 WHERE id = ?3",
                params![state.as_str(), clock::now_rfc3339(), record.id],
            )
            .sql()?;
            Ok(())
        });

        match result {
            Ok(()) => {
                self.journal.commit(&op)?;
                self.journal.sync(&op)?;
                Ok(state)
            }
            Err(e) => {
                let _ = self.journal.rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }
}
