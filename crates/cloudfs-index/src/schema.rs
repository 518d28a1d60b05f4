//! Index schema. New databases bootstrap directly to the latest version.

use rusqlite::Connection;

use cloudfs_core::CloudfsResult;

use crate::store::SqlExt;

pub const SCHEMA_VERSION: i64 = 1;

const LATEST_SCHEMA: &[&str] = &[
    // File/directory tree. Uniqueness is (parent, name).
    "CREATE TABLE IF NOT EXISTS entries (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id       INTEGER REFERENCES entries(id) ON DELETE CASCADE,
        name            TEXT NOT NULL,
        entry_kind      TEXT NOT NULL CHECK(entry_kind IN ('file', 'directory')),
        logical_size    INTEGER NOT NULL DEFAULT 0,
        physical_size   INTEGER NOT NULL DEFAULT 0,
        parity_size     INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL,
        modified_at     TEXT NOT NULL,
        classification  TEXT,
        UNIQUE(parent_id, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries(parent_id)",
    // Immutable atomic units; only state may change.
    "CREATE TABLE IF NOT EXISTS versions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id        INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        version_num     INTEGER NOT NULL,
        content_hash    TEXT NOT NULL,
        size            INTEGER NOT NULL,
        created_at      TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'incomplete'
                        CHECK(state IN ('incomplete', 'active', 'superseded', 'deleted')),
        UNIQUE(entry_id, version_num)
    )",
    "CREATE INDEX IF NOT EXISTS idx_versions_entry ON versions(entry_id)",
    "CREATE INDEX IF NOT EXISTS idx_versions_state ON versions(state)",
    "CREATE TABLE IF NOT EXISTS chunks (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        version_id      INTEGER NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
        chunk_index     INTEGER NOT NULL,
        chunk_hash      TEXT NOT NULL,
        size            INTEGER NOT NULL,
        UNIQUE(version_id, chunk_index)
    )",
    "CREATE TABLE IF NOT EXISTS placements (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        chunk_id        INTEGER REFERENCES chunks(id) ON DELETE CASCADE,
        version_id      INTEGER REFERENCES versions(id) ON DELETE CASCADE,
        provider_id     TEXT NOT NULL,
        remote_path     TEXT NOT NULL,
        uploaded_at     TEXT NOT NULL,
        verified_at     TEXT,
        state           TEXT NOT NULL DEFAULT 'pending'
                        CHECK(state IN ('pending', 'uploaded', 'verified', 'degraded', 'failed'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_placements_version ON placements(version_id)",
    "CREATE INDEX IF NOT EXISTS idx_placements_provider ON placements(provider_id)",
    // current_usage is a cached display figure, never used for quota.
    "CREATE TABLE IF NOT EXISTS providers (
        name            TEXT PRIMARY KEY,
        kind            TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'active'
                        CHECK(status IN ('active', 'inactive', 'error')),
        priority        INTEGER NOT NULL DEFAULT 1,
        soft_limit      INTEGER,
        hard_limit      INTEGER,
        current_usage   INTEGER NOT NULL DEFAULT 0,
        capabilities    TEXT,
        requires_encryption INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS provider_config (
        provider_id     TEXT NOT NULL REFERENCES providers(name) ON DELETE CASCADE,
        key             TEXT NOT NULL,
        value           TEXT NOT NULL,
        PRIMARY KEY (provider_id, key)
    )",
    // The index is the source of truth for cache state; on-disk strays are
    // reconcilable but not trusted.
    "CREATE TABLE IF NOT EXISTS cache_entries (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id        INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        version_id      INTEGER NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
        cache_path      TEXT NOT NULL,
        cached_at       TEXT NOT NULL,
        last_accessed   TEXT NOT NULL,
        pinned          INTEGER NOT NULL DEFAULT 0,
        state           TEXT NOT NULL DEFAULT 'valid'
                        CHECK(state IN ('valid', 'stale', 'pending_eviction')),
        UNIQUE(entry_id, version_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON cache_entries(last_accessed)",
    "CREATE TABLE IF NOT EXISTS hydration_state (
        entry_id        INTEGER PRIMARY KEY REFERENCES entries(id) ON DELETE CASCADE,
        current_state   TEXT NOT NULL DEFAULT 'placeholder'
                        CHECK(current_state IN ('placeholder', 'hydrating', 'hydrated', 'partial')),
        hydrated_version_id INTEGER REFERENCES versions(id),
        hydration_progress INTEGER NOT NULL DEFAULT 0,
        last_hydrated   TEXT
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT NOT NULL UNIQUE,
        created_at      TEXT NOT NULL,
        description     TEXT
    )",
    "CREATE TABLE IF NOT EXISTS snapshot_versions (
        snapshot_id     INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
        version_id      INTEGER NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
        PRIMARY KEY (snapshot_id, version_id)
    )",
    "CREATE TABLE IF NOT EXISTS trash (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        original_entry_id INTEGER NOT NULL,
        original_path   TEXT NOT NULL,
        deleted_at      TEXT NOT NULL,
        version_id      INTEGER REFERENCES versions(id),
        auto_purge_after TEXT
    )",
    "CREATE TABLE IF NOT EXISTS policies (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT NOT NULL UNIQUE,
        policy_type     TEXT NOT NULL,
        config          TEXT NOT NULL,
        priority        INTEGER NOT NULL DEFAULT 0
    )",
    // Write-ahead journal. Rows reach durable storage before dependent
    // changes become observable.
    "CREATE TABLE IF NOT EXISTS journal (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id    TEXT NOT NULL UNIQUE,
        operation_type  TEXT NOT NULL,
        payload         TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'pending'
                        CHECK(state IN ('pending', 'committed', 'synced', 'rolled_back')),
        created_at      TEXT NOT NULL,
        completed_at    TEXT,
        rollback_reason TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_journal_state ON journal(state)",
    "CREATE TABLE IF NOT EXISTS archives (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id        INTEGER NOT NULL REFERENCES entries(id),
        archive_path    TEXT NOT NULL,
        parity_path     TEXT NOT NULL,
        original_size   INTEGER NOT NULL,
        archive_size    INTEGER NOT NULL,
        content_hash    TEXT NOT NULL,
        parity_level    INTEGER NOT NULL DEFAULT 10,
        state           TEXT NOT NULL DEFAULT 'active'
                        CHECK(state IN ('active', 'verified', 'corrupt')),
        created_at      TEXT NOT NULL,
        verified_at     TEXT
    )",
    "CREATE TABLE IF NOT EXISTS index_meta (
        key             TEXT PRIMARY KEY,
        value           TEXT NOT NULL
    )",
];

/// Create any missing tables and stamp the schema version.
pub fn bootstrap(conn: &Connection) -> CloudfsResult<()> {
    for statement in LATEST_SCHEMA {
        conn.execute(statement, []).sql()?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )
    .sql()?;
    conn.execute(
        "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('created_at', ?1)",
        [cloudfs_core::clock::now_rfc3339()],
    )
    .sql()?;
    Ok(())
}

/// Read the stored schema version.
pub fn current_version(conn: &Connection) -> CloudfsResult<i64> {
    let raw: String = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )
        .sql()?;
    raw.parse::<i64>()
        .map_err(|_| cloudfs_core::CloudfsError::Corrupt(format!("bad schema version {raw:?}")))
}
