//! Ingest and push: getting user bytes under management and onto providers.
//!
//! `add` fingerprints a local file, creates the entry/version rows, moves
//! the bytes into the cache, and replaces the original with a placeholder —
//! all inside one journal operation. `push` uploads placement-less active
//! versions according to a freshly revalidated placement plan.

use std::path::Path;

use serde::{Deserialize, Serialize};

use cloudfs_core::types::{
    Entry, EntryKind, HydrationState, PlacementState, Version, VersionState,
};
use cloudfs_core::{CloudfsError, CloudfsResult};
use cloudfs_index::{NewEntry, NewPlacement, NewVersion, SqlExt};
use cloudfs_provider::Provider;

use crate::hashing::sha256_file;
use crate::placeholder::PlaceholderDescriptor;
use crate::Engine;

#[derive(Debug)]
pub struct AddOutcome {
    pub entry: Entry,
    /// `None` for directories, which carry no versions.
    pub version: Option<Version>,
}

#[derive(Debug)]
pub struct PushReport {
    pub pushed: Vec<PushedItem>,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug)]
pub struct PushedItem {
    pub entry_id: i64,
    pub name: String,
    pub provider_id: String,
    pub remote_path: String,
}

#[derive(Debug)]
pub struct SkippedItem {
    pub entry_id: i64,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct VerifySummary {
    pub verified: usize,
    pub degraded: usize,
}

#[derive(Serialize, Deserialize)]
struct AddPayload {
    rel_path: String,
    size: i64,
    content_hash: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PushPayload {
    pub entry_id: i64,
    pub version_id: i64,
    pub provider_id: String,
    pub remote_path: String,
}

struct PendingUpload {
    entry_id: i64,
    name: String,
    version_id: i64,
    version_num: i64,
    content_hash: String,
    size: i64,
}

impl Engine {
    /// Bring a file (or directory) under management. For files the original
    /// is replaced by a placeholder once the bytes are safely in the cache;
    /// re-adding an entry supersedes its current active version.
    pub async fn add(&self, path: &Path) -> CloudfsResult<AddOutcome> {
        let _guard = self.write_lock().lock().await;

        let root = std::fs::canonicalize(self.layout().root())?;
        let abs = std::fs::canonicalize(path)?;
        let rel = abs
            .strip_prefix(&root)
            .map_err(|_| {
                CloudfsError::invalid(format!(
                    "{} is outside the repository root {}",
                    path.display(),
                    root.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/");
        if rel.is_empty() {
            return Err(CloudfsError::invalid("cannot add the repository root"));
        }
        if rel.starts_with(".cloudfs") {
            return Err(CloudfsError::invalid("cannot add the control directory"));
        }

        let meta = std::fs::metadata(&abs)?;
        if meta.is_dir() {
            return self.add_directory(&rel).await;
        }

        let size = meta.len() as i64;
        let content_hash = sha256_file(&abs)?;

        let op = self.journal().begin(
            "add",
            &AddPayload {
                rel_path: rel.clone(),
                size,
                content_hash: content_hash.clone(),
            },
        )?;

        let result: CloudfsResult<AddOutcome> = (|| {
            // Parent directory entries along the relative path.
            let mut parent: Option<i64> = None;
            let components: Vec<&str> = rel.split('/').filter(|c| !c.is_empty()).collect();
            let (dirs, name) = components.split_at(components.len() - 1);
            for dir in dirs {
                parent = Some(self.index().ensure_directory(&op, parent, dir)?.id);
            }
            let name = name[0];

            let entry = match self.index().entry_by_name(parent, name)? {
                Some(existing) => {
                    if existing.kind != EntryKind::File {
                        return Err(CloudfsError::AlreadyExists(format!(
                            "{rel} exists as a directory"
                        )));
                    }
                    if let Some(active) = self.index().active_version(existing.id)? {
                        self.index()
                            .set_version_state(&op, active.id, VersionState::Superseded)?;
                    }
                    self.index().update_entry_sizes(&op, existing.id, size, size)?;
                    self.index()
                        .entry(existing.id)?
                        .ok_or_else(|| CloudfsError::Storage("entry vanished".into()))?
                }
                None => self.index().create_entry(
                    &op,
                    &NewEntry {
                        parent_id: parent,
                        name: name.to_string(),
                        kind: EntryKind::File,
                        logical_size: size,
                        physical_size: size,
                        classification: None,
                    },
                )?,
            };

            let version = self.index().create_version(
                &op,
                &NewVersion {
                    entry_id: entry.id,
                    content_hash: content_hash.clone(),
                    size,
                    state: VersionState::Active,
                },
            )?;

            // Stage a copy for the cache; the cache consumes the staged
            // file, never the user's original.
            let temp_dir = self.layout().temp_dir();
            std::fs::create_dir_all(&temp_dir)?;
            let staged = temp_dir.join(format!("ingest_{}_{}", entry.id, version.id));
            std::fs::copy(&abs, &staged)?;
            if let Err(e) = self.cache().put(&op, entry.id, version.id, &staged) {
                let _ = std::fs::remove_file(&staged);
                return Err(e);
            }

            // The original becomes a placeholder; the bytes now live in the
            // cache and (after push) on providers.
            let descriptor = PlaceholderDescriptor::for_version(&entry, &version, None, None);
            self.placeholders().dehydrate(&rel, &descriptor)?;
            self.index()
                .set_hydration(&op, entry.id, HydrationState::Placeholder, None, 0)?;

            Ok(AddOutcome {
                entry,
                version: Some(version),
            })
        })();

        match result {
            Ok(outcome) => {
                self.journal().commit(&op)?;
                self.journal().sync(&op)?;
                tracing::info!(path = %rel, entry = outcome.entry.id, "added");
                Ok(outcome)
            }
            Err(e) => {
                let _ = self.journal().rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    async fn add_directory(&self, rel: &str) -> CloudfsResult<AddOutcome> {
        let op = self.journal().begin(
            "add",
            &AddPayload {
                rel_path: rel.to_string(),
                size: 0,
                content_hash: String::new(),
            },
        )?;
        let result: CloudfsResult<Entry> = (|| {
            let mut parent: Option<i64> = None;
            let mut entry = None;
            for component in rel.split('/').filter(|c| !c.is_empty()) {
                let dir = self.index().ensure_directory(&op, parent, component)?;
                parent = Some(dir.id);
                entry = Some(dir);
            }
            entry.ok_or_else(|| CloudfsError::invalid("empty directory path"))
        })();

        match result {
            Ok(entry) => {
                std::fs::create_dir_all(self.placeholders().real_path(rel))?;
                self.journal().commit(&op)?;
                self.journal().sync(&op)?;
                tracing::info!(path = %rel, entry = entry.id, "added directory");
                Ok(AddOutcome {
                    entry,
                    version: None,
                })
            }
            Err(e) => {
                let _ = self.journal().rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    /// Upload every active file version that has no placement yet. Each
    /// upload gets a fresh plan, revalidated against live provider usage
    /// immediately before the transfer.
    pub async fn push(&self) -> CloudfsResult<PushReport> {
        let _guard = self.write_lock().lock().await;

        let pending = self.pending_uploads()?;
        let mut report = PushReport {
            pushed: Vec::new(),
            skipped: Vec::new(),
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let encrypted = self.config().push.encrypted;
        for item in pending {
            match self.push_one(&item, encrypted).await {
                Ok(pushed) => report.pushed.push(pushed),
                Err(e) => {
                    tracing::warn!(entry = item.entry_id, name = %item.name, "push failed: {e}");
                    report.skipped.push(SkippedItem {
                        entry_id: item.entry_id,
                        name: item.name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    fn pending_uploads(&self) -> CloudfsResult<Vec<PendingUpload>> {
        self.store().with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT e.id, e.name, v.id, v.version_num, v.content_hash, v.size
                     FROM entries e
                     JOIN versions v ON e.id = v.entry_id AND v.state = 'active'
                     LEFT JOIN placements p ON v.id = p.version_id
                     WHERE e.entry_kind = 'file' AND p.id IS NULL
                     ORDER BY e.id",
                )
                .sql()?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(PendingUpload {
                        entry_id: r.get(0)?,
                        name: r.get(1)?,
                        version_id: r.get(2)?,
                        version_num: r.get(3)?,
                        content_hash: r.get(4)?,
                        size: r.get(5)?,
                    })
                })
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })
    }

    async fn push_one(&self, item: &PendingUpload, encrypted: bool) -> CloudfsResult<PushedItem> {
        let mut plan = self
            .planner()
            .plan(&item.name, item.size, encrypted)
            .await?;
        if plan.is_rejected() {
            let reasons: Vec<String> = plan
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.provider_id, r.reason))
                .collect();
            return Err(CloudfsError::invalid(if reasons.is_empty() {
                "no providers configured".to_string()
            } else {
                format!("no suitable provider ({})", reasons.join("; "))
            }));
        }
        // The plan was tentative; the gap to now matters.
        self.planner().revalidate(&mut plan).await?;
        let target = &plan.placements[0];

        let source = match self.cache().get(item.entry_id, item.version_id)? {
            Some(path) => path,
            None => {
                let entry = self
                    .index()
                    .entry(item.entry_id)?
                    .ok_or_else(|| CloudfsError::not_found(format!("entry {}", item.entry_id)))?;
                let rel = self.index().entry_path(&entry)?;
                let real = self.placeholders().real_path(&rel);
                if !real.exists() {
                    return Err(CloudfsError::not_found(
                        "source bytes in neither cache nor projection".to_string(),
                    ));
                }
                real
            }
        };

        let remote_path = format!(
            "entries/{}/{}/{}",
            item.entry_id, item.version_num, item.name
        );
        let op = self.journal().begin(
            "push",
            &PushPayload {
                entry_id: item.entry_id,
                version_id: item.version_id,
                provider_id: target.provider_id.clone(),
                remote_path: remote_path.clone(),
            },
        )?;

        let provider = match self.registry().require(&target.provider_id) {
            Ok(provider) => provider,
            Err(e) => {
                let _ = self.journal().rollback(&op, &e.to_string());
                return Err(e);
            }
        };

        let result: CloudfsResult<()> = async {
            let receipt = provider.upload(&source, &remote_path, None).await?;
            if let Some(remote_hash) = &receipt.content_hash {
                if !item.content_hash.is_empty() && remote_hash != &item.content_hash {
                    return Err(CloudfsError::HashMismatch {
                        expected: item.content_hash.clone(),
                        actual: remote_hash.clone(),
                    });
                }
            }
            self.index().create_placement(
                &op,
                &NewPlacement {
                    version_id: Some(item.version_id),
                    chunk_id: None,
                    provider_id: target.provider_id.clone(),
                    remote_path: remote_path.clone(),
                    state: PlacementState::Uploaded,
                },
            )?;
            // Refresh the display-only cached usage figure.
            if let Ok(usage) = provider.usage().await {
                let _ = self
                    .index()
                    .set_cached_usage(&op, &target.provider_id, usage.used_bytes);
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                // Enrich the placeholder with its backing location.
                if let Some(entry) = self.index().entry(item.entry_id)? {
                    let rel = self.index().entry_path(&entry)?;
                    if self.placeholders().placeholder_path(&rel).exists() {
                        if let Some(version) = self.index().version(item.version_id)? {
                            let descriptor = PlaceholderDescriptor::for_version(
                                &entry,
                                &version,
                                Some(target.provider_id.clone()),
                                Some(remote_path.clone()),
                            );
                            let _ = self.placeholders().create(&rel, &descriptor);
                        }
                    }
                }
                self.journal().commit(&op)?;
                self.journal().sync(&op)?;
                tracing::info!(
                    entry = item.entry_id,
                    provider = %target.provider_id,
                    remote = %remote_path,
                    "pushed"
                );
                Ok(PushedItem {
                    entry_id: item.entry_id,
                    name: item.name.clone(),
                    provider_id: target.provider_id.clone(),
                    remote_path,
                })
            }
            Err(e) => {
                let _ = self.journal().rollback(&op, &e.to_string());
                Err(e)
            }
        }
    }

    /// Re-verify uploaded placements against their providers, refreshing
    /// `verified_at` and promoting `uploaded → verified`; objects that fail
    /// the check are downgraded.
    pub async fn verify_placements(&self) -> CloudfsResult<VerifySummary> {
        let _guard = self.write_lock().lock().await;

        struct Candidate {
            placement_id: i64,
            provider_id: String,
            remote_path: String,
            content_hash: String,
        }

        let candidates = self.store().with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT p.id, p.provider_id, p.remote_path, COALESCE(v.content_hash, '')
                     FROM placements p
                     LEFT JOIN versions v ON p.version_id = v.id
                     WHERE p.state IN ('uploaded', 'verified')",
                )
                .sql()?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(Candidate {
                        placement_id: r.get(0)?,
                        provider_id: r.get(1)?,
                        remote_path: r.get(2)?,
                        content_hash: r.get(3)?,
                    })
                })
                .sql()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .sql();
            rows
        })?;

        if candidates.is_empty() {
            return Ok(VerifySummary::default());
        }

        let op = self.journal().begin(
            "verify",
            &serde_json::json!({ "count": candidates.len() }),
        )?;
        let mut report = VerifySummary::default();
        for candidate in candidates {
            let healthy = match self.registry().require(&candidate.provider_id) {
                Ok(provider) => match provider.verify(&candidate.remote_path).await {
                    Ok(remote) => {
                        remote.is_valid
                            && match (&remote.content_hash, candidate.content_hash.as_str()) {
                                (Some(remote_hash), expected) if !expected.is_empty() => {
                                    remote_hash == expected
                                }
                                _ => true,
                            }
                    }
                    Err(e) => {
                        tracing::warn!(
                            remote = %candidate.remote_path,
                            "verification errored: {e}"
                        );
                        false
                    }
                },
                Err(_) => false,
            };
            if healthy {
                self.index()
                    .mark_placement_verified(&op, candidate.placement_id)?;
                report.verified += 1;
            } else {
                self.index().set_placement_state(
                    &op,
                    candidate.placement_id,
                    PlacementState::Degraded,
                )?;
                report.degraded += 1;
            }
        }
        self.journal().commit(&op)?;
        self.journal().sync(&op)?;
        Ok(report)
    }
}
