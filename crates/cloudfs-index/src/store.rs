//! SQLCipher-backed store for the metadata index.
//!
//! Two modes: unencrypted (no passphrase, intended for tests and opt-out
//! setups) and passphrase-encrypted (AES-256 via SQLCipher). A wrong
//! passphrase fails on the first query against `sqlite_master`, never later.

use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use cloudfs_core::{CloudfsError, CloudfsResult};

/// Map a rusqlite failure onto the core error taxonomy.
pub fn map_sqlite(e: rusqlite::Error) -> CloudfsError {
    match &e {
        rusqlite::Error::SqliteFailure(f, msg) => match f.code {
            ErrorCode::NotADatabase => CloudfsError::WrongKey,
            ErrorCode::DatabaseCorrupt => {
                CloudfsError::Corrupt(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                CloudfsError::Busy(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            ErrorCode::ConstraintViolation => {
                CloudfsError::AlreadyExists(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => CloudfsError::Storage(e.to_string()),
        },
        rusqlite::Error::QueryReturnedNoRows => CloudfsError::NotFound("row".into()),
        _ => CloudfsError::Storage(e.to_string()),
    }
}

/// Shorthand for `map_err(map_sqlite)` at SQL call sites.
pub trait SqlExt<T> {
    fn sql(self) -> CloudfsResult<T>;
}

impl<T> SqlExt<T> for rusqlite::Result<T> {
    fn sql(self) -> CloudfsResult<T> {
        self.map_err(map_sqlite)
    }
}

pub struct EncryptedStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    encrypted: bool,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("path", &self.path)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl EncryptedStore {
    /// Open (or create) the store. A passphrase switches on SQLCipher; the
    /// key is verified immediately so a wrong passphrase surfaces here.
    pub fn open(path: &Path, passphrase: Option<&str>) -> CloudfsResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).sql()?;
        conn.busy_timeout(Duration::from_secs(5)).sql()?;

        let encrypted = match passphrase {
            Some(key) if !key.is_empty() => {
                conn.pragma_update(None, "key", key).sql()?;
                true
            }
            _ => false,
        };

        // First query. With the wrong key SQLCipher cannot read the header
        // and this fails with NotADatabase, which maps to WrongKey.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .sql()?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).sql()?;
        conn.pragma_update(None, "synchronous", "NORMAL").sql()?;
        conn.pragma_update(None, "foreign_keys", "ON").sql()?;

        tracing::debug!(path = %path.display(), encrypted, "opened index store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            encrypted,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Run `f` against the shared connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> CloudfsResult<T>,
    ) -> CloudfsResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| CloudfsError::Storage("store lock poisoned".into()))?;
        f(&conn)
    }

    /// Run `f` inside a transaction: committed on `Ok`, rolled back on `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> CloudfsResult<T>,
    ) -> CloudfsResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| CloudfsError::Storage("store lock poisoned".into()))?;
        let tx = conn.transaction().sql()?;
        let out = f(&tx)?;
        tx.commit().sql()?;
        Ok(out)
    }

    /// Re-key the whole store atomically. Refused for unencrypted stores;
    /// use an encrypted open from the start if encryption is wanted.
    pub fn change_passphrase(&self, new_passphrase: &str) -> CloudfsResult<()> {
        if !self.encrypted {
            return Err(CloudfsError::Unsupported(
                "store is not encrypted; rekey requires an encrypted store".into(),
            ));
        }
        if new_passphrase.is_empty() {
            return Err(CloudfsError::invalid("new passphrase must not be empty"));
        }
        self.with_conn(|conn| {
            conn.pragma_update(None, "rekey", new_passphrase).sql()?;
            Ok(())
        })?;
        tracing::info!(path = %self.path.display(), "index re-keyed");
        Ok(())
    }

    /// Export a self-contained recovery bundle: a consistent copy of the
    /// (still encrypted) store plus plain-text recovery instructions that
    /// work with stock sqlcipher.
    pub fn export_recovery_bundle(&self, bundle_dir: &Path) -> CloudfsResult<PathBuf> {
        std::fs::create_dir_all(bundle_dir)?;
        let db_copy = bundle_dir.join("index.db");
        if db_copy.exists() {
            std::fs::remove_file(&db_copy)?;
        }

        // VACUUM INTO produces a consistent single-file copy under the
        // connection's lock, including the encryption.
        let copied = self.with_conn(|conn| {
            let target = db_copy.to_string_lossy().replace('\'', "''");
            match conn.execute_batch(&format!("VACUUM INTO '{target}'")) {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::warn!("VACUUM INTO failed, falling back to file copy: {e}");
                    Ok(false)
                }
            }
        })?;
        if !copied {
            std::fs::copy(&self.path, &db_copy)?;
        }

        let readme = format!(
            "CloudFS Recovery Bundle\n\
             =======================\n\n\
             Contents:\n\
             - index.db: the metadata index ({})\n\n\
             RECOVERY WITH CLOUDFS:\n\
             1. cloudfs init <root>\n\
             2. Replace <root>/.cloudfs/index.db with the bundled index.db\n\
             3. cloudfs repair\n\n\
             MANUAL RECOVERY WITHOUT CLOUDFS:\n\
             1. Install sqlcipher (any recent release)\n\
             2. sqlcipher index.db\n\
             3. PRAGMA key = 'your-passphrase';\n\
             4. SELECT * FROM entries LIMIT 5;\n\n\
             The passphrase is NOT stored in this bundle. Without it the\n\
             data cannot be recovered.\n\n\
             SCHEMA OVERVIEW:\n\
             - entries:        file and directory metadata (parent/child tree)\n\
             - versions:       immutable file versions, SHA-256 fingerprints\n\
             - chunks:         ordered sub-units of large versions\n\
             - placements:     where each version lives on which provider\n\
             - providers:      configured storage backends\n\
             - cache_entries:  local cache state\n\
             - hydration_state: per-entry placeholder/hydrated state\n\
             - snapshots, snapshot_versions: named version sets\n\
             - trash:          soft-deleted entries\n\
             - archives:       cold-storage bundle records\n\
             - journal:        write-ahead log for crash recovery\n\n\
             For the full schema run: .schema\n",
            if self.encrypted {
                "SQLCipher-encrypted, AES-256"
            } else {
                "unencrypted SQLite"
            }
        );
        std::fs::write(bundle_dir.join("README.txt"), readme)?;

        tracing::info!(bundle = %bundle_dir.display(), "exported recovery bundle");
        Ok(db_copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn open_at(dir: &Path, pass: Option<&str>) -> CloudfsResult<EncryptedStore> {
        EncryptedStore::open(&dir.join("index.db"), pass)
    }

    #[test]
    fn open_unencrypted_and_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_at(dir.path(), None).unwrap();
        assert!(!store.is_encrypted());
        store.with_conn(|c| schema::bootstrap(c)).unwrap();
        let version = store
            .with_conn(|c| {
                c.query_row(
                    "SELECT value FROM index_meta WHERE key = 'schema_version'",
                    [],
                    |r| r.get::<_, String>(0),
                )
                .sql()
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION.to_string());
    }

    #[test]
    fn wrong_passphrase_fails_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_at(dir.path(), Some("correct horse")).unwrap();
            store.with_conn(|c| schema::bootstrap(c)).unwrap();
        }
        let err = open_at(dir.path(), Some("battery staple")).unwrap_err();
        assert!(matches!(err, CloudfsError::WrongKey), "got {err:?}");

        // Opening an encrypted store with no key at all must also fail.
        let err = open_at(dir.path(), None).unwrap_err();
        assert!(matches!(err, CloudfsError::WrongKey), "got {err:?}");
    }

    #[test]
    fn rekey_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_at(dir.path(), Some("old-pass")).unwrap();
            store.with_conn(|c| schema::bootstrap(c)).unwrap();
            store.change_passphrase("new-pass").unwrap();
        }
        assert!(open_at(dir.path(), Some("old-pass")).is_err());
        let store = open_at(dir.path(), Some("new-pass")).unwrap();
        assert!(store.is_encrypted());
    }

    #[test]
    fn rekey_refused_for_unencrypted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_at(dir.path(), None).unwrap();
        assert!(matches!(
            store.change_passphrase("x"),
            Err(CloudfsError::Unsupported(_))
        ));
    }

    #[test]
    fn recovery_bundle_contains_db_and_readme() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_at(dir.path(), Some("pass")).unwrap();
        store.with_conn(|c| schema::bootstrap(c)).unwrap();

        let bundle = dir.path().join("bundle");
        let db_copy = store.export_recovery_bundle(&bundle).unwrap();
        assert!(db_copy.exists());
        let readme = std::fs::read_to_string(bundle.join("README.txt")).unwrap();
        assert!(readme.contains("sqlcipher"));
        assert!(readme.contains("PRAGMA key"));

        // The bundled copy opens with the same passphrase.
        let copy = EncryptedStore::open(&db_copy, Some("pass")).unwrap();
        assert!(copy.is_encrypted());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_at(dir.path(), None).unwrap();
        store.with_conn(|c| schema::bootstrap(c)).unwrap();

        let result: CloudfsResult<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO index_meta (key, value) VALUES ('tx_probe', '1')",
                [],
            )
            .sql()?;
            Err(CloudfsError::invalid("boom"))
        });
        assert!(result.is_err());

        let count = store
            .with_conn(|c| {
                c.query_row(
                    "SELECT count(*) FROM index_meta WHERE key = 'tx_probe'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .sql()
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
