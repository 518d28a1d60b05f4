//! Overview aggregation for dashboards and `cloudfs overview`.

use std::sync::Arc;

use cloudfs_core::CloudfsResult;
use cloudfs_index::{EncryptedStore, SqlExt};

use crate::cache::{CacheStats, CacheStore};
use crate::health::{self, OverallHealth};

#[derive(Debug)]
pub struct Overview {
    pub file_count: i64,
    pub directory_count: i64,
    pub total_logical_bytes: i64,
    pub hydrated_count: i64,
    pub provider_count: i64,
    pub placement_count: i64,
    pub snapshot_count: i64,
    pub trash_count: i64,
    pub archive_count: i64,
    pub unresolved_journal_count: i64,
    pub cache: CacheStats,
    pub health: OverallHealth,
}

pub fn overview(store: &Arc<EncryptedStore>, cache: &CacheStore) -> CloudfsResult<Overview> {
    let counts = store.with_conn(|conn| {
        let file_count: i64 = conn
            .query_row(
                "SELECT count(*) FROM entries WHERE entry_kind = 'file'",
                [],
                |r| r.get(0),
            )
            .sql()?;
        let directory_count: i64 = conn
            .query_row(
                "SELECT count(*) FROM entries WHERE entry_kind = 'directory'",
                [],
                |r| r.get(0),
            )
            .sql()?;
        let total_logical_bytes: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM versions WHERE state = 'active'",
                [],
                |r| r.get(0),
            )
            .sql()?;
        let hydrated_count: i64 = conn
            .query_row(
                "SELECT count(*) FROM hydration_state WHERE current_state = 'hydrated'",
                [],
                |r| r.get(0),
            )
            .sql()?;
        let provider_count: i64 = conn
            .query_row("SELECT count(*) FROM providers", [], |r| r.get(0))
            .sql()?;
        let placement_count: i64 = conn
            .query_row("SELECT count(*) FROM placements", [], |r| r.get(0))
            .sql()?;
        let snapshot_count: i64 = conn
            .query_row("SELECT count(*) FROM snapshots", [], |r| r.get(0))
            .sql()?;
        let trash_count: i64 = conn
            .query_row("SELECT count(*) FROM trash", [], |r| r.get(0))
            .sql()?;
        let archive_count: i64 = conn
            .query_row("SELECT count(*) FROM archives", [], |r| r.get(0))
            .sql()?;
        let unresolved_journal_count: i64 = conn
            .query_row(
                "SELECT count(*) FROM journal WHERE state IN ('pending', 'committed')",
                [],
                |r| r.get(0),
            )
            .sql()?;
        Ok((
            file_count,
            directory_count,
            total_logical_bytes,
            hydrated_count,
            provider_count,
            placement_count,
            snapshot_count,
            trash_count,
            archive_count,
            unresolved_journal_count,
        ))
    })?;

    Ok(Overview {
        file_count: counts.0,
        directory_count: counts.1,
        total_logical_bytes: counts.2,
        hydrated_count: counts.3,
        provider_count: counts.4,
        placement_count: counts.5,
        snapshot_count: counts.6,
        trash_count: counts.7,
        archive_count: counts.8,
        unresolved_journal_count: counts.9,
        cache: cache.stats()?,
        health: health::overall_health(store)?,
    })
}
