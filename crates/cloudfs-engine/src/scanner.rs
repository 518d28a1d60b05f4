//! Read-only consistency scans. Findings only — the scanner never mutates
//! anything; fixes go through `repair` or explicit operator commands.

use std::sync::Arc;

use cloudfs_core::CloudfsResult;
use cloudfs_index::{schema, EncryptedStore, Index, Journal, SqlExt};
use cloudfs_provider::{Provider, ProviderHealth, ProviderRegistry};

use crate::cache::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub suggestion: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub scan_type: String,
    pub total_items: i64,
    pub findings: Vec<Finding>,
}

impl ScanReport {
    fn push(&mut self, severity: Severity, category: &str, description: String) {
        self.findings.push(Finding {
            severity,
            category: category.to_string(),
            description,
            suggestion: None,
        });
    }

    fn push_with_suggestion(
        &mut self,
        severity: Severity,
        category: &str,
        description: String,
        suggestion: &str,
    ) {
        self.findings.push(Finding {
            severity,
            category: category.to_string(),
            description,
            suggestion: Some(suggestion.to_string()),
        });
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

pub struct Scanner {
    store: Arc<EncryptedStore>,
    index: Arc<Index>,
    journal: Arc<Journal>,
}

impl Scanner {
    pub fn new(store: Arc<EncryptedStore>, index: Arc<Index>, journal: Arc<Journal>) -> Self {
        Self {
            store,
            index,
            journal,
        }
    }

    pub fn scan_index(&self) -> CloudfsResult<ScanReport> {
        let mut report = ScanReport {
            scan_type: "index".into(),
            ..Default::default()
        };

        match self.index.meta_get("schema_version")? {
            Some(version) => {
                report.push(
                    Severity::Ok,
                    "schema",
                    format!("schema version {version}"),
                );
                if version != schema::SCHEMA_VERSION.to_string() {
                    report.push_with_suggestion(
                        Severity::Warning,
                        "schema",
                        format!(
                            "index schema {version} differs from expected {}",
                            schema::SCHEMA_VERSION
                        ),
                        "upgrade cloudfs or re-init the repository",
                    );
                }
            }
            None => report.push_with_suggestion(
                Severity::Error,
                "schema",
                "missing schema version".into(),
                "re-initialize with `cloudfs init`",
            ),
        }

        report.total_items = self.store.with_conn(|conn| {
            conn.query_row("SELECT count(*) FROM entries", [], |r| r.get(0)).sql()
        })?;
        report.push(
            Severity::Ok,
            "entries",
            format!("{} entries", report.total_items),
        );

        for finding in self.index.validate()? {
            report.push_with_suggestion(
                Severity::Warning,
                "integrity",
                finding,
                "run `cloudfs repair`",
            );
        }

        let files_without_version: i64 = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT count(*) FROM entries e
                 WHERE e.entry_kind = 'file'
                   AND NOT EXISTS (SELECT 1 FROM versions v
                                   WHERE v.entry_id = e.id AND v.state = 'active')
                   AND NOT EXISTS (SELECT 1 FROM trash t
                                   WHERE t.original_entry_id = e.id)",
                [],
                |r| r.get(0),
            )
            .sql()
        })?;
        if files_without_version > 0 {
            report.push(
                Severity::Warning,
                "versions",
                format!("{files_without_version} file(s) without an active version"),
            );
        }

        let unresolved = self.journal.pending()?;
        if unresolved.is_empty() {
            report.push(Severity::Ok, "journal", "no unresolved operations".into());
        } else {
            report.push_with_suggestion(
                Severity::Warning,
                "journal",
                format!("{} unresolved journal operation(s)", unresolved.len()),
                "run `cloudfs repair` or `cloudfs journal resume`",
            );
        }

        Ok(report)
    }

    pub fn scan_cache(&self, cache: &CacheStore) -> CloudfsResult<ScanReport> {
        let mut report = ScanReport {
            scan_type: "cache".into(),
            ..Default::default()
        };

        let rows = self.index.cache_entries(false, false)?;
        report.total_items = rows.len() as i64;
        let mut missing = 0;
        for row in &rows {
            if !row.cache_path.exists() {
                missing += 1;
                report.push_with_suggestion(
                    Severity::Warning,
                    "cache",
                    format!(
                        "cache row for entry {} version {} has no file on disk",
                        row.entry_id, row.version_id
                    ),
                    "evict the row or re-hydrate",
                );
            }
        }
        if missing == 0 {
            report.push(
                Severity::Ok,
                "cache",
                format!("{} cache row(s), all backed by files", rows.len()),
            );
        }

        // Strays on disk with no row are reconcilable, never trusted.
        let known: std::collections::HashSet<_> =
            rows.iter().map(|r| r.cache_path.clone()).collect();
        for entry in walkdir::WalkDir::new(cache.cache_dir().join("entries"))
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file() && !known.contains(entry.path()) {
                report.push(
                    Severity::Warning,
                    "cache",
                    format!("stray cache file {}", entry.path().display()),
                );
            }
        }

        Ok(report)
    }

    pub async fn scan_providers(&self, registry: &ProviderRegistry) -> CloudfsResult<ScanReport> {
        let mut report = ScanReport {
            scan_type: "providers".into(),
            ..Default::default()
        };

        let records = self.index.list_providers()?;
        report.total_items = records.len() as i64;
        if records.is_empty() {
            report.push_with_suggestion(
                Severity::Warning,
                "providers",
                "no providers configured".into(),
                "add one with `cloudfs provider add`",
            );
            return Ok(report);
        }

        for record in records {
            match registry.get(&record.name)? {
                None => report.push(
                    Severity::Error,
                    "providers",
                    format!("provider {} is configured but not loadable", record.name),
                ),
                Some(provider) => match provider.check_health().await {
                    ProviderHealth::Healthy => report.push(
                        Severity::Ok,
                        "providers",
                        format!("{} healthy", record.name),
                    ),
                    ProviderHealth::Degraded => report.push(
                        Severity::Warning,
                        "providers",
                        format!("{} degraded", record.name),
                    ),
                    ProviderHealth::Unavailable => report.push(
                        Severity::Error,
                        "providers",
                        format!("{} unavailable", record.name),
                    ),
                },
            }
        }

        Ok(report)
    }
}
