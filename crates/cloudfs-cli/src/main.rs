//! cloudfs: local control plane for cloud storage.
//!
//! Core commands:
//!   init                 - create a repository in the current directory
//!   add <path>           - bring a file under management (becomes a placeholder)
//!   push                 - upload unplaced versions to providers
//!   hydrate <path>       - materialize a placeholder as a real file
//!   dehydrate <path>     - convert a real file back to a placeholder
//!   rm <path>            - move an entry to trash (soft delete)
//!
//! The index passphrase is read from CLOUDFS_PASSPHRASE; when unset the
//! index is opened unencrypted.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use cloudfs_core::config::PASSPHRASE_ENV;
use cloudfs_engine::hydration::HydrateOptions;
use cloudfs_engine::scanner::ScanReport;
use cloudfs_engine::{Engine, ProviderSettings};
use cloudfs_provider::OpendalProviderConfig;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cloudfs",
    version,
    about = "Local control plane for cloud storage",
    long_about = "cloudfs tracks files in an encrypted index, projects them as \
                  placeholders, and hydrates or pushes them only on explicit request."
)]
struct Cli {
    /// Repository root
    #[arg(long, short = 'C', default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new repository
    Init,

    /// Bring a file or directory under management
    Add {
        path: PathBuf,
    },

    /// Move an entry to trash (soft delete; no remote mutation)
    Rm {
        path: String,
    },

    /// List entries with their hydration state
    Ls {
        path: Option<String>,
    },

    /// Upload active versions that have no placement yet
    Push,

    /// Download and materialize placeholders as real files
    Hydrate {
        paths: Vec<String>,
        /// Pin the cache entries afterwards
        #[arg(long)]
        pin: bool,
    },

    /// Convert a hydrated file back into a placeholder
    Dehydrate {
        path: String,
    },

    /// Pin an entry's cache content against eviction
    Pin {
        path: String,
    },

    /// Remove the eviction pin
    Unpin {
        path: String,
    },

    /// Cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Provider management
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },

    /// Journal inspection and recovery
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },

    /// Metadata snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Trash management
    Trash {
        #[command(subcommand)]
        action: TrashAction,
    },

    /// Cold archives (7z + par2)
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },

    /// Explain everything known about one entry
    Explain {
        path: String,
    },

    /// Read-only consistency scans
    Scan {
        /// index, cache, providers, or all
        #[arg(default_value = "all")]
        target: String,
    },

    /// Repository overview
    Overview,

    /// Re-verify placements against providers
    Verify,

    /// Resolve unresolved journal operations and reconcile the projection
    Repair,

    /// Export a recovery bundle (consistent index copy + instructions)
    Backup {
        dir: PathBuf,
    },

    /// Change the index passphrase
    Rekey {
        #[arg(long, env = "CLOUDFS_NEW_PASSPHRASE", hide_env_values = true)]
        new_passphrase: String,
    },

    /// Check index structural invariants
    Validate,

    /// Delete the repository control directory and all placeholders
    Destroy {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// List cached entries
    List {
        #[arg(long)]
        pinned: bool,
    },
    /// Cache statistics
    Stats,
    /// Evict one entry's cached content
    Evict {
        path: String,
        #[arg(long)]
        yes: bool,
    },
    /// Evict every unpinned entry
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Suggest eviction candidates (least recently used first)
    Suggest {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ProviderAction {
    /// Register a storage provider
    Add {
        name: String,
        /// Backend kind: fs or s3
        #[arg(long)]
        kind: String,
        /// Filesystem root (fs) or bucket prefix (s3)
        #[arg(long)]
        root: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long, default_value_t = 1)]
        priority: i64,
        #[arg(long)]
        soft_limit: Option<i64>,
        #[arg(long)]
        hard_limit: Option<i64>,
        /// Advertised capacity in bytes
        #[arg(long)]
        capacity: Option<i64>,
        #[arg(long)]
        requires_encryption: bool,
    },
    /// List configured providers
    List,
    /// Live status for one provider
    Status {
        name: String,
    },
    /// Remove a provider
    Remove {
        name: String,
        /// Also delete its remote data (goes through the delete coordinator)
        #[arg(long)]
        delete_data: bool,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum JournalAction {
    /// Recent journal operations
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Resume one committed operation
    Resume {
        operation_id: String,
    },
    /// Roll back one unresolved operation
    Rollback {
        operation_id: String,
        #[arg(long, default_value = "operator rollback")]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotAction {
    Create {
        name: String,
        #[arg(long, short = 'm')]
        description: Option<String>,
    },
    List,
    Inspect {
        name: String,
    },
    /// Show what restore would change
    Preview {
        name: String,
    },
    Restore {
        name: String,
        #[arg(long)]
        yes: bool,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum TrashAction {
    List,
    /// Restore an entry by its original path
    Restore {
        path: String,
    },
    /// Permanently delete trash entries (invokes remote deletes)
    Purge {
        /// Original path of one trash entry
        path: Option<String>,
        #[arg(long, conflicts_with = "path")]
        all: bool,
        /// Only entries past their auto-purge deadline
        #[arg(long, conflicts_with_all = ["path", "all"])]
        expired: bool,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveAction {
    /// Create a cold archive from an entry's cached or local bytes
    Create {
        path: String,
        #[arg(long)]
        parity_level: Option<u32>,
    },
    List,
    /// Run parity verification
    Verify {
        path: String,
    },
    /// Extract into the cache and verify the fingerprint
    Restore {
        path: String,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn passphrase() -> Option<String> {
    std::env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty())
}

fn open_engine(root: &PathBuf) -> Result<Engine> {
    Engine::open(root, passphrase().as_deref()).context("opening repository")
}

fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_scan(report: &ScanReport) {
    use cloudfs_engine::scanner::Severity;
    println!(
        "scan {}: {} item(s), {} ok / {} warning / {} error",
        report.scan_type,
        report.total_items,
        report.count(Severity::Ok),
        report.count(Severity::Warning),
        report.count(Severity::Error),
    );
    for finding in &report.findings {
        match &finding.suggestion {
            Some(suggestion) => println!(
                "  [{}] {}: {} ({suggestion})",
                finding.severity.as_str(),
                finding.category,
                finding.description
            ),
            None => println!(
                "  [{}] {}: {}",
                finding.severity.as_str(),
                finding.category,
                finding.description
            ),
        }
    }
}

fn resolve_entry_id(engine: &Engine, path: &str) -> Result<i64> {
    Ok(engine
        .index()
        .resolve_path(path)?
        .with_context(|| format!("no entry at {path}"))?
        .id)
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CLOUDFS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init => {
            Engine::init(&cli.root, passphrase().as_deref())?;
            println!("Initialized CloudFS repository at {}", cli.root.display());
            if passphrase().is_none() {
                println!("note: {PASSPHRASE_ENV} is unset; the index is unencrypted");
            }
        }

        Commands::Add { path } => {
            let engine = open_engine(&cli.root)?;
            let outcome = engine.add(&path).await?;
            match outcome.version {
                Some(version) => println!(
                    "Added {} (entry {}, version {}, {})",
                    path.display(),
                    outcome.entry.id,
                    version.version_num,
                    format_bytes(version.size)
                ),
                None => println!("Added directory {}", path.display()),
            }
        }

        Commands::Rm { path } => {
            let engine = open_engine(&cli.root)?;
            engine.rm(&path).await?;
            println!("Moved to trash: {path}");
        }

        Commands::Ls { path } => {
            let engine = open_engine(&cli.root)?;
            for item in engine.ls(path.as_deref())? {
                let size = item
                    .active_version
                    .as_ref()
                    .map(|v| format_bytes(v.size))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<12} {:>10}  {}",
                    item.hydration.state.as_str(),
                    size,
                    item.path
                );
            }
        }

        Commands::Push => {
            let engine = open_engine(&cli.root)?;
            let report = engine.push().await?;
            if report.pushed.is_empty() && report.skipped.is_empty() {
                println!("Nothing to push.");
            }
            for item in &report.pushed {
                println!("Pushed {} -> {} ({})", item.name, item.provider_id, item.remote_path);
            }
            for item in &report.skipped {
                eprintln!("Skipped {}: {}", item.name, item.reason);
            }
            if !report.skipped.is_empty() {
                bail!("{} item(s) failed to push", report.skipped.len());
            }
        }

        Commands::Hydrate { paths, pin } => {
            if paths.is_empty() {
                bail!("hydrate needs at least one path");
            }
            let engine = open_engine(&cli.root)?;
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("{msg:<30} [{bar:40}] {pos:>3}%")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let progress_bar = bar.clone();
            let opts = HydrateOptions {
                pin_after: pin,
                progress: Some(Arc::new(move |_entry, percent| {
                    progress_bar.set_position(percent as u64);
                })),
                cancel: tokio_util::sync::CancellationToken::new(),
            };

            let mut failures = 0;
            for (path, result) in engine.hydrate_batch(&paths, &opts).await? {
                bar.set_message(path.clone());
                match result {
                    Ok(outcome) if outcome.already_hydrated => {
                        println!("{path}: already hydrated")
                    }
                    Ok(outcome) => {
                        println!("{path}: hydrated ({})", format_bytes(outcome.bytes_loaded))
                    }
                    Err(e) => {
                        failures += 1;
                        eprintln!("{path}: {e}");
                    }
                }
            }
            bar.finish_and_clear();
            if failures > 0 {
                bail!("{failures} hydration(s) failed");
            }
        }

        Commands::Dehydrate { path } => {
            let engine = open_engine(&cli.root)?;
            engine.dehydrate(&path).await?;
            println!("Dehydrated {path}");
        }

        Commands::Pin { path } => {
            let engine = open_engine(&cli.root)?;
            engine.pin(&path).await?;
            println!("Pinned {path}");
        }

        Commands::Unpin { path } => {
            let engine = open_engine(&cli.root)?;
            engine.unpin(&path).await?;
            println!("Unpinned {path}");
        }

        Commands::Cache { action } => run_cache(&cli.root, action).await?,
        Commands::Provider { action } => run_provider(&cli.root, action).await?,
        Commands::Journal { action } => run_journal(&cli.root, action).await?,
        Commands::Snapshot { action } => run_snapshot(&cli.root, action)?,
        Commands::Trash { action } => run_trash(&cli.root, action).await?,
        Commands::Archive { action } => run_archive(&cli.root, action).await?,

        Commands::Explain { path } => {
            let engine = open_engine(&cli.root)?;
            let explanation = engine.explain(&path)?;
            println!("{}", explanation.path);
            println!("  entry id:   {}", explanation.entry.id);
            println!("  kind:       {}", explanation.entry.kind);
            println!("  hydration:  {}", explanation.hydration_state);
            if let Some(version) = &explanation.active_version {
                println!(
                    "  active:     v{} ({}, sha256:{})",
                    version.version_num,
                    format_bytes(version.size),
                    &version.content_hash[..16.min(version.content_hash.len())]
                );
            }
            println!("  versions:   {}", explanation.version_history.len());
            for location in &explanation.locations {
                match &location.provider_id {
                    Some(provider) => println!(
                        "  location:   {} on {} ({}verified)",
                        location.path,
                        provider,
                        if location.verified { "" } else { "un" }
                    ),
                    None => println!("  location:   {} ({})", location.path, location.location_type),
                }
            }
            if explanation.cache.is_cached {
                println!(
                    "  cache:      present{}",
                    if explanation.cache.pinned { ", pinned" } else { "" }
                );
            }
            if let Some(archive) = &explanation.archive {
                println!(
                    "  archive:    {} ({}, parity {}%)",
                    archive.archive_path.display(),
                    archive.state.as_str(),
                    archive.parity_level
                );
            }
            println!(
                "  health:     {:.2} ({})",
                explanation.health.score,
                cloudfs_engine::health::describe(explanation.health.score)
            );
            for issue in &explanation.health.issues {
                println!("    issue: {issue}");
            }
            if let Some(trash) = &explanation.trash {
                println!("  trash:      deleted {} day(s) ago", trash.days_in_trash);
            }
            for op in &explanation.pending_ops {
                println!(
                    "  pending op: {} ({}, {})",
                    op.operation_id,
                    op.operation_type,
                    op.state.as_str()
                );
            }
        }

        Commands::Scan { target } => {
            let engine = open_engine(&cli.root)?;
            match target.as_str() {
                "index" => print_scan(&engine.scan_index()?),
                "cache" => print_scan(&engine.scan_cache()?),
                "providers" => print_scan(&engine.scan_providers().await?),
                "all" => {
                    print_scan(&engine.scan_index()?);
                    print_scan(&engine.scan_cache()?);
                    print_scan(&engine.scan_providers().await?);
                }
                other => bail!("unknown scan target {other:?} (index|cache|providers|all)"),
            }
        }

        Commands::Overview => {
            let engine = open_engine(&cli.root)?;
            let overview = engine.overview()?;
            println!("Entries:     {} files, {} directories", overview.file_count, overview.directory_count);
            println!("Logical:     {}", format_bytes(overview.total_logical_bytes));
            println!("Hydrated:    {}", overview.hydrated_count);
            println!(
                "Cache:       {} entries ({} pinned), {} on disk",
                overview.cache.total_entries,
                overview.cache.pinned_entries,
                format_bytes(overview.cache.disk_usage as i64)
            );
            println!(
                "Providers:   {} ({} placements)",
                overview.provider_count, overview.placement_count
            );
            println!("Snapshots:   {}", overview.snapshot_count);
            println!("Trash:       {}", overview.trash_count);
            println!("Archives:    {}", overview.archive_count);
            println!(
                "Health:      {:.2} avg ({} healthy / {} warning / {} critical)",
                overview.health.average_score,
                overview.health.healthy_entries,
                overview.health.warning_entries,
                overview.health.critical_entries
            );
            if overview.unresolved_journal_count > 0 {
                println!(
                    "Journal:     {} unresolved operation(s) — run `cloudfs repair`",
                    overview.unresolved_journal_count
                );
            }
        }

        Commands::Verify => {
            let engine = open_engine(&cli.root)?;
            let summary = engine.verify_placements().await?;
            println!(
                "Verified {} placement(s), {} degraded",
                summary.verified, summary.degraded
            );
            if summary.degraded > 0 {
                bail!("{} placement(s) failed verification", summary.degraded);
            }
        }

        Commands::Repair => {
            let engine = open_engine(&cli.root)?;
            let report = engine.repair().await?;
            for action in &report.journal_actions {
                println!(
                    "journal {} ({}): {}",
                    action.operation_id, action.operation_type, action.action
                );
            }
            println!(
                "Repair complete: {} placeholder(s) recreated, {} stale real file(s) removed",
                report.placeholders_created, report.stale_reals_removed
            );
        }

        Commands::Backup { dir } => {
            let engine = open_engine(&cli.root)?;
            let bundle = engine.export_recovery_bundle(&dir)?;
            println!("Recovery bundle written to {}", bundle.display());
        }

        Commands::Rekey { new_passphrase } => {
            let engine = open_engine(&cli.root)?;
            engine.change_passphrase(&new_passphrase)?;
            println!("Index re-keyed. Update {PASSPHRASE_ENV} before the next command.");
        }

        Commands::Validate => {
            let engine = open_engine(&cli.root)?;
            let findings = engine.validate()?;
            if findings.is_empty() {
                println!("Index is structurally consistent.");
            } else {
                for finding in &findings {
                    eprintln!("invariant violation: {finding}");
                }
                bail!("{} invariant violation(s)", findings.len());
            }
        }

        Commands::Destroy { yes } => {
            let confirmed = yes
                || confirm(&format!(
                    "Destroy the repository at {} (index, cache, placeholders)?",
                    cli.root.display()
                ));
            let engine = open_engine(&cli.root)?;
            engine.destroy(confirmed).await?;
            println!("Repository destroyed. Real files were left in place.");
        }
    }
    Ok(())
}

async fn run_cache(root: &PathBuf, action: CacheAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        CacheAction::List { pinned } => {
            let rows = engine.cache().list(cloudfs_engine::cache::CacheFilter {
                pinned_only: pinned,
                stale_only: false,
            })?;
            for row in rows {
                println!(
                    "entry {:>4} v{:<4} {:<8} {}{}",
                    row.entry_id,
                    row.version_id,
                    row.state.as_str(),
                    row.cache_path.display(),
                    if row.pinned { " [pinned]" } else { "" }
                );
            }
        }
        CacheAction::Stats => {
            let stats = engine.cache().stats()?;
            println!("Entries:   {}", stats.total_entries);
            println!("Pinned:    {}", stats.pinned_entries);
            println!("Stale:     {}", stats.stale_entries);
            println!("Disk use:  {}", format_bytes(stats.disk_usage as i64));
        }
        CacheAction::Evict { path, yes } => {
            let confirmed = yes || confirm(&format!("Evict cached content for {path}?"));
            engine.cache_evict(&path, confirmed).await?;
            println!("Evicted {path}");
        }
        CacheAction::Clear { yes } => {
            let confirmed = yes || confirm("Evict ALL unpinned cache entries?");
            let count = engine.cache_clear(confirmed).await?;
            println!("Evicted {count} cache entr(y/ies)");
        }
        CacheAction::Suggest { limit } => {
            let candidates = engine.cache().eviction_candidates(limit)?;
            if candidates.is_empty() {
                println!("No eviction candidates (everything is pinned or the cache is empty).");
            }
            for row in candidates {
                println!(
                    "entry {:>4} v{:<4} last accessed {}",
                    row.entry_id,
                    row.version_id,
                    cloudfs_core::clock::to_rfc3339(row.last_accessed)
                );
            }
        }
    }
    Ok(())
}

async fn run_provider(root: &PathBuf, action: ProviderAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        ProviderAction::Add {
            name,
            kind,
            root: provider_root,
            endpoint,
            region,
            bucket,
            priority,
            soft_limit,
            hard_limit,
            capacity,
            requires_encryption,
        } => {
            engine
                .add_provider(
                    OpendalProviderConfig {
                        id: name.clone(),
                        kind,
                        display_name: name.clone(),
                        root: provider_root,
                        endpoint,
                        region,
                        bucket,
                        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                        capacity_bytes: capacity,
                        requires_encryption,
                    },
                    ProviderSettings {
                        priority,
                        soft_limit,
                        hard_limit,
                        requires_encryption,
                    },
                )
                .await?;
            println!("Registered provider {name}");
        }
        ProviderAction::List => {
            for record in engine.index().list_providers()? {
                println!(
                    "{:<16} {:<6} {:<8} priority {}  cached usage {}",
                    record.name,
                    record.kind,
                    record.status.as_str(),
                    record.priority,
                    format_bytes(record.current_usage)
                );
            }
        }
        ProviderAction::Status { name } => {
            let status = engine.provider_status(&name).await?;
            println!("{} ({})", status.record.name, status.record.kind);
            println!("  status:     {}", status.record.status.as_str());
            println!("  health:     {}", status.health.as_str());
            println!("  placements: {}", status.placement_count);
            match status.usage {
                Some(usage) => println!(
                    "  usage:      {} used / {} available (live)",
                    format_bytes(usage.used_bytes),
                    format_bytes(usage.available_bytes)
                ),
                None => println!("  usage:      unavailable"),
            }
        }
        ProviderAction::Remove {
            name,
            delete_data,
            yes,
        } => {
            let confirmed = if delete_data {
                yes || confirm(&format!(
                    "Remove provider {name} AND delete its remote data? This is irreversible."
                ))
            } else {
                true
            };
            engine.remove_provider(&name, delete_data, confirmed).await?;
            println!("Removed provider {name}");
        }
    }
    Ok(())
}

async fn run_journal(root: &PathBuf, action: JournalAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        JournalAction::List { limit } => {
            for row in engine.journal().recent(limit)? {
                println!(
                    "{}  {:<12} {:<16} {}",
                    cloudfs_core::clock::to_rfc3339(row.created_at),
                    row.state.as_str(),
                    row.operation_type,
                    row.operation_id
                );
                if let Some(reason) = row.rollback_reason {
                    println!("    reason: {reason}");
                }
            }
        }
        JournalAction::Resume { operation_id } => {
            let action = engine.journal_resume(&operation_id).await?;
            println!("{}: {}", action.operation_id, action.action);
        }
        JournalAction::Rollback {
            operation_id,
            reason,
        } => {
            engine.journal_rollback(&operation_id, &reason).await?;
            println!("Rolled back {operation_id}");
        }
    }
    Ok(())
}

fn run_snapshot(root: &PathBuf, action: SnapshotAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        SnapshotAction::Create { name, description } => {
            let snapshot = engine.snapshots().create(&name, description.as_deref())?;
            println!("Created snapshot {} (id {})", snapshot.name, snapshot.id);
        }
        SnapshotAction::List => {
            for snapshot in engine.snapshots().list()? {
                println!(
                    "{:<24} {}  {}",
                    snapshot.name,
                    cloudfs_core::clock::to_rfc3339(snapshot.created_at),
                    snapshot.description.unwrap_or_default()
                );
            }
        }
        SnapshotAction::Inspect { name } => {
            let details = engine.snapshots().inspect(&name)?;
            println!("{}", details.snapshot.name);
            println!("  entries:  {}", details.entry_count);
            println!("  versions: {}", details.version_count);
            println!("  size:     {}", format_bytes(details.total_size));
        }
        SnapshotAction::Preview { name } => {
            let preview = engine.snapshots().restore_preview(&name)?;
            for entry in &preview.entries_to_add {
                println!("+ {entry}");
            }
            for entry in &preview.entries_to_remove {
                println!("- {entry}");
            }
            println!("{} version change(s)", preview.version_changes);
        }
        SnapshotAction::Restore { name, yes } => {
            let preview = engine.snapshots().restore_preview(&name)?;
            let confirmed = yes
                || confirm(&format!(
                    "Restore snapshot {name} ({} version change(s))?",
                    preview.version_changes
                ));
            if !confirmed {
                bail!("restore aborted");
            }
            engine.snapshots().restore(&name)?;
            println!("Restored snapshot {name}");
        }
        SnapshotAction::Delete { name } => {
            engine.snapshots().delete(&name)?;
            println!("Deleted snapshot {name} (versions remain)");
        }
    }
    Ok(())
}

async fn run_trash(root: &PathBuf, action: TrashAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        TrashAction::List => {
            for info in engine.trash().list()? {
                let deadline = info
                    .entry
                    .auto_purge_after
                    .map(cloudfs_core::clock::to_rfc3339)
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{:<4} {:<32} {:>10}  {} day(s) in trash, auto-purge {}",
                    info.entry.id,
                    info.entry.original_path,
                    format_bytes(info.size),
                    info.days_in_trash,
                    deadline
                );
            }
        }
        TrashAction::Restore { path } => {
            let info = engine
                .trash()
                .get_by_path(&path)?
                .with_context(|| format!("{path} is not in trash"))?;
            engine.trash().restore(info.entry.id)?;
            println!("Restored {path}");
        }
        TrashAction::Purge {
            path,
            all,
            expired,
            yes,
        } => {
            let outcome = if all {
                let confirmed =
                    yes || confirm("Permanently delete EVERYTHING in trash (remote included)?");
                engine.trash().purge_all(confirmed).await?
            } else if expired {
                let confirmed = yes || confirm("Permanently delete expired trash entries?");
                engine.trash().purge_expired(confirmed).await?
            } else {
                let path = path.context("purge needs a path, --all, or --expired")?;
                let info = engine
                    .trash()
                    .get_by_path(&path)?
                    .with_context(|| format!("{path} is not in trash"))?;
                let confirmed = yes
                    || confirm(&format!(
                        "Permanently delete {path} ({}, remote included)?",
                        format_bytes(info.size)
                    ));
                engine.trash().purge(info.entry.id, confirmed).await?
            };
            println!(
                "Purged {} entr(y/ies); {} remote object(s) deleted, {} failed",
                outcome.purged, outcome.remote_deleted, outcome.remote_failed
            );
            for error in &outcome.errors {
                eprintln!("  {error}");
            }
            if outcome.remote_failed > 0 {
                bail!("{} remote delete(s) failed; affected entries were kept", outcome.remote_failed);
            }
        }
    }
    Ok(())
}

async fn run_archive(root: &PathBuf, action: ArchiveAction) -> Result<()> {
    let engine = open_engine(root)?;
    match action {
        ArchiveAction::Create { path, parity_level } => {
            let entry_id = resolve_entry_id(&engine, &path)?;
            let version = engine
                .index()
                .active_version(entry_id)?
                .with_context(|| format!("{path} has no active version"))?;
            // Archive from the cache copy when present, otherwise from the
            // hydrated real file.
            let source = match engine.cache().get(entry_id, version.id)? {
                Some(path) => path,
                None => {
                    let real = engine.placeholders().real_path(&path);
                    if !real.exists() {
                        bail!("{path} is neither cached nor hydrated; hydrate it first");
                    }
                    real
                }
            };
            let parity = parity_level.unwrap_or(engine.config().archive.parity_level);
            let record = engine.archives().create(entry_id, &source, parity).await?;
            println!(
                "Archived {} -> {} ({} -> {})",
                path,
                record.archive_path.display(),
                format_bytes(record.original_size),
                format_bytes(record.archive_size)
            );
        }
        ArchiveAction::List => {
            for record in engine.archives().list()? {
                println!(
                    "entry {:>4} {:<8} {}  parity {}%",
                    record.entry_id,
                    record.state.as_str(),
                    record.archive_path.display(),
                    record.parity_level
                );
            }
        }
        ArchiveAction::Verify { path } => {
            let entry_id = resolve_entry_id(&engine, &path)?;
            let state = engine.archives().verify(entry_id).await?;
            println!("Archive for {path}: {}", state.as_str());
        }
        ArchiveAction::Restore { path } => {
            let entry_id = resolve_entry_id(&engine, &path)?;
            let extracted = engine.archives().restore(entry_id).await?;
            println!("Restored to {}", extracted.display());
        }
    }
    Ok(())
}
