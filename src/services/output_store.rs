use crate::config::{ConfigManager, ConfigWarning};
use crate::models::{FailureReason, OperationKind, OutputConfig};
use crate::services::path_policy::{self, MAX_COLLISION_SUFFIX, OUTPUT_EXTENSION};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, TimeDelta};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;
use walkdir::WalkDir;

/// Default inventory export file name, written under the output root.
pub const INVENTORY_FILE_NAME: &str = "file_list.json";

/// Filesystem failures surfaced by the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory { path: Utf8PathBuf, source: io::Error },

    #[error("{path} exists and is not a directory")]
    NotADirectory { path: Utf8PathBuf },

    #[error("Failed to reserve destination {path}: {source}")]
    Reserve { path: Utf8PathBuf, source: io::Error },

    #[error("No free name for {path} after {attempts} attempts")]
    NoFreeName { path: Utf8PathBuf, attempts: u32 },
}

impl StoreError {
    pub fn path(&self) -> &Utf8Path {
        match self {
            StoreError::CreateDirectory { path, .. }
            | StoreError::NotADirectory { path }
            | StoreError::Reserve { path, .. }
            | StoreError::NoFreeName { path, .. } => path,
        }
    }

    pub fn io_kind(&self) -> ErrorKind {
        match self {
            StoreError::CreateDirectory { source, .. } | StoreError::Reserve { source, .. } => {
                source.kind()
            }
            StoreError::NotADirectory { .. } | StoreError::NoFreeName { .. } => {
                ErrorKind::AlreadyExists
            }
        }
    }
}

impl From<StoreError> for FailureReason {
    fn from(error: StoreError) -> Self {
        FailureReason::Filesystem {
            path: error.path().to_path_buf(),
            kind: error.io_kind(),
            message: error.to_string(),
        }
    }
}

/// Count, size and age range of a group of artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStatistics {
    pub count: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Local>>,
    pub newest: Option<DateTime<Local>>,
}

static EMPTY_KIND_STATISTICS: KindStatistics = KindStatistics {
    count: 0,
    total_bytes: 0,
    oldest: None,
    newest: None,
};

impl KindStatistics {
    fn add(&mut self, size: u64, modified: DateTime<Local>) {
        self.count += 1;
        self.total_bytes += size;
        self.oldest = Some(self.oldest.map_or(modified, |t| t.min(modified)));
        self.newest = Some(self.newest.map_or(modified, |t| t.max(modified)));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub count: usize,
    pub total_bytes: u64,
}

/// A directory holding more artifacts than `max_files_per_directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrowdedDirectory {
    pub path: Utf8PathBuf,
    pub files: usize,
}

/// Aggregate view of the output tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputStatistics {
    pub base_directory: Utf8PathBuf,
    pub total_files: usize,
    pub total_bytes: u64,
    /// Every kind is present, in declaration order.
    pub by_kind: IndexMap<OperationKind, KindStatistics>,
    pub unclassified: KindStatistics,
    /// Keyed by `YYYY-MM` of modification time.
    pub by_month: BTreeMap<String, UsageBucket>,
    /// Entries skipped because they could not be read.
    pub inaccessible: usize,
    pub crowded_directories: Vec<CrowdedDirectory>,
}

impl OutputStatistics {
    pub fn kind(&self, kind: OperationKind) -> &KindStatistics {
        self.by_kind.get(&kind).unwrap_or(&EMPTY_KIND_STATISTICS)
    }
}

/// Manual cleanup knobs; defaults reproduce the configured auto-cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Overrides `auto_cleanup_days`. 0 still means "delete nothing".
    pub older_than_days: Option<u32>,
    /// Restrict the sweep to these kind folders.
    pub kinds: Option<Vec<OperationKind>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub path: Utf8PathBuf,
    pub reason: String,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// `None` when the sweep was disabled.
    pub cutoff: Option<DateTime<Local>>,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: Vec<CleanupFailure>,
    pub bytes_freed: u64,
    pub removed_directories: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    /// Relative to the output root
    pub path: Utf8PathBuf,
    pub kind: Option<OperationKind>,
    pub size_bytes: u64,
    pub modified_at: DateTime<Local>,
}

/// Document written by [`OutputStore::export_inventory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub exported_at: DateTime<Local>,
    pub base_directory: Utf8PathBuf,
    pub summary: OutputStatistics,
    /// Newest first
    pub files: Vec<InventoryEntry>,
}

struct ScannedFile {
    path: Utf8PathBuf,
    relative: Utf8PathBuf,
    kind: Option<OperationKind>,
    size: u64,
    modified: DateTime<Local>,
}

struct ScannedDirectory {
    path: Utf8PathBuf,
    relative: Utf8PathBuf,
    depth: usize,
    modified: Option<DateTime<Local>>,
}

/// Snapshot of the output tree taken in a single walk.
#[derive(Default)]
struct Scan {
    files: Vec<ScannedFile>,
    directories: Vec<ScannedDirectory>,
    inaccessible: usize,
}

impl Scan {
    fn take(root: &Utf8Path) -> Self {
        let mut scan = Scan::default();
        if !root.is_dir() {
            return scan;
        }

        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping inaccessible entry: {}", e);
                    scan.inaccessible += 1;
                    continue;
                }
            };

            let Ok(path) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
                tracing::debug!("Skipping non UTF-8 path: {}", entry.path().display());
                scan.inaccessible += 1;
                continue;
            };
            let relative = path
                .strip_prefix(root)
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());

            let file_type = entry.file_type();
            if file_type.is_dir() {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Local>::from);
                scan.directories.push(ScannedDirectory {
                    path,
                    relative,
                    depth: entry.depth(),
                    modified,
                });
                continue;
            }

            if !file_type.is_file() || !is_pdf(&path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::debug!("Skipping unreadable file {}: {}", path, e);
                    scan.inaccessible += 1;
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => DateTime::<Local>::from(modified),
                Err(e) => {
                    tracing::debug!("No modification time for {}: {}", path, e);
                    scan.inaccessible += 1;
                    continue;
                }
            };

            scan.files.push(ScannedFile {
                kind: OperationKind::classify(&relative),
                path,
                relative,
                size: metadata.len(),
                modified,
            });
        }

        scan
    }
}

fn is_pdf(path: &Utf8Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(OUTPUT_EXTENSION))
}

/// Whether a root-relative path falls under one of the selected kind folders.
fn in_scope(relative: &Utf8Path, kinds: Option<&[OperationKind]>) -> bool {
    let Some(kinds) = kinds else {
        return true;
    };
    relative
        .components()
        .next()
        .and_then(|first| OperationKind::from_folder(first.as_str()))
        .is_some_and(|kind| kinds.contains(&kind))
}

/// Owner of the output root and its configuration.
///
/// Configuration is held as an `Arc` snapshot: readers clone the `Arc` and
/// never observe a partially applied update. All mutations go through
/// [`update_configuration`](Self::update_configuration), serialized by `save_lock`.
pub struct OutputStore {
    config_manager: ConfigManager,
    config: RwLock<Arc<OutputConfig>>,
    save_lock: Mutex<()>,
    load_warning: RwLock<Option<ConfigWarning>>,
}

impl OutputStore {
    /// Load the persisted configuration and take ownership of it.
    ///
    /// Never fails on a bad configuration file; see [`load_warning`](Self::load_warning).
    pub fn open(config_manager: ConfigManager) -> Self {
        let loaded = config_manager.load_output_config();
        Self {
            config_manager,
            config: RwLock::new(Arc::new(loaded.config)),
            save_lock: Mutex::new(()),
            load_warning: RwLock::new(loaded.warning),
        }
    }

    /// Use `config` in memory without reading or writing the backing file.
    pub fn with_config(config_manager: ConfigManager, config: OutputConfig) -> Self {
        Self {
            config_manager,
            config: RwLock::new(Arc::new(config)),
            save_lock: Mutex::new(()),
            load_warning: RwLock::new(None),
        }
    }

    /// Snapshot of the current configuration
    pub fn configuration(&self) -> Arc<OutputConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Why the last load fell back to defaults, if it did
    pub fn load_warning(&self) -> Option<ConfigWarning> {
        self.load_warning
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn base_dir(&self) -> Utf8PathBuf {
        self.configuration().base_output_dir.clone()
    }

    /// Re-read the backing file, replacing the in-memory configuration.
    pub fn reload_configuration(&self) -> Option<ConfigWarning> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let loaded = self.config_manager.load_output_config();
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(loaded.config);
        *self
            .load_warning
            .write()
            .unwrap_or_else(PoisonError::into_inner) = loaded.warning.clone();
        loaded.warning
    }

    /// Persist `config` and make it current.
    pub fn save_configuration(&self, config: OutputConfig) -> Result<()> {
        self.update_configuration(|current| *current = config)?;
        Ok(())
    }

    /// Apply `update_fn` to a copy of the configuration, validate, persist, then swap.
    ///
    /// On any error the current configuration is unchanged.
    pub fn update_configuration<F>(&self, update_fn: F) -> Result<Arc<OutputConfig>>
    where
        F: FnOnce(&mut OutputConfig),
    {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.configuration()).clone();
        update_fn(&mut next);
        next.validate().context("Rejected output configuration")?;

        self.config_manager.save_output_config(&next)?;

        let next = Arc::new(next);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        *self
            .load_warning
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        tracing::info!(
            "Output configuration updated: base={}, cleanup_days={}, subdirectories={}, timestamp={}",
            next.base_output_dir,
            next.auto_cleanup_days,
            next.create_subdirectories,
            next.add_timestamp
        );
        Ok(next)
    }

    /// Point the store at a new output root and create it.
    pub fn set_base_output_directory<P: AsRef<Utf8Path>>(&self, directory: P) -> Result<()> {
        let directory = directory.as_ref().to_path_buf();
        self.update_configuration(|config| config.base_output_dir = directory.clone())?;
        self.ensure_directory(&directory)?;
        Ok(())
    }

    /// Create all missing segments of `path`.
    ///
    /// Idempotent; a directory created concurrently by another caller counts
    /// as success.
    pub fn ensure_directory(&self, path: &Utf8Path) -> Result<(), StoreError> {
        match fs::create_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => {
                if path.exists() && !path.is_dir() {
                    return Err(StoreError::NotADirectory {
                        path: path.to_path_buf(),
                    });
                }
                return Err(StoreError::CreateDirectory {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }

        if !path.is_dir() {
            return Err(StoreError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        tracing::trace!("Directory ready: {}", path);
        Ok(())
    }

    /// Reserve a destination by creating it empty.
    ///
    /// If `planned` is taken, `name_(1).pdf`, `name_(2).pdf`, ... are tried up
    /// to [`MAX_COLLISION_SUFFIX`]. Creation is exclusive, so two concurrent
    /// callers never receive the same path.
    pub fn claim_destination(&self, planned: &Utf8Path) -> Result<Utf8PathBuf, StoreError> {
        let mut attempt: u32 = 0;
        let mut recreated_parent = false;

        loop {
            let candidate = if attempt == 0 {
                planned.to_path_buf()
            } else {
                path_policy::collision_candidate(planned, attempt)
            };

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(_) => {
                    if attempt > 0 {
                        tracing::warn!("Destination {} already exists, using {}", planned, candidate);
                    }
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    attempt += 1;
                    if attempt > MAX_COLLISION_SUFFIX {
                        return Err(StoreError::NoFreeName {
                            path: planned.to_path_buf(),
                            attempts: MAX_COLLISION_SUFFIX,
                        });
                    }
                }
                // A concurrent sweep may have pruned the directory
                Err(e) if e.kind() == ErrorKind::NotFound && !recreated_parent => {
                    recreated_parent = true;
                    match candidate.parent() {
                        Some(parent) => self.ensure_directory(parent)?,
                        None => {
                            return Err(StoreError::Reserve {
                                path: candidate,
                                source: e,
                            });
                        }
                    }
                }
                Err(e) => {
                    return Err(StoreError::Reserve {
                        path: candidate,
                        source: e,
                    });
                }
            }
        }
    }

    /// Remove a reservation the transform never wrote to.
    pub fn release_reservation(&self, path: &Utf8Path) {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() && metadata.len() == 0 => {
                if let Err(e) = fs::remove_file(path) {
                    tracing::debug!("Could not remove empty reservation {}: {}", path, e);
                }
            }
            _ => {}
        }
    }

    /// Create and return the directory for one batch run started at `now`.
    pub fn batch_directory(
        &self,
        kind: OperationKind,
        now: DateTime<Local>,
    ) -> Result<Utf8PathBuf, StoreError> {
        let config = self.configuration();
        let directory = path_policy::batch_directory(kind, &config, now.naive_local());
        self.ensure_directory(&directory)?;
        Ok(directory)
    }

    /// Walk the output root and aggregate per-kind statistics.
    ///
    /// Unreadable entries are counted in `inaccessible` and skipped.
    pub fn statistics(&self) -> OutputStatistics {
        let config = self.configuration();
        let scan = Scan::take(&config.base_output_dir);
        Self::summarize(&config, &scan)
    }

    fn summarize(config: &OutputConfig, scan: &Scan) -> OutputStatistics {
        let mut stats = OutputStatistics {
            base_directory: config.base_output_dir.clone(),
            by_kind: OperationKind::ALL
                .into_iter()
                .map(|kind| (kind, KindStatistics::default()))
                .collect(),
            inaccessible: scan.inaccessible,
            ..OutputStatistics::default()
        };

        let mut per_directory: HashMap<&Utf8Path, usize> = HashMap::new();
        for file in &scan.files {
            stats.total_files += 1;
            stats.total_bytes += file.size;

            match file.kind {
                Some(kind) => stats.by_kind.entry(kind).or_default().add(file.size, file.modified),
                None => stats.unclassified.add(file.size, file.modified),
            }

            let bucket = stats
                .by_month
                .entry(file.modified.format("%Y-%m").to_string())
                .or_default();
            bucket.count += 1;
            bucket.total_bytes += file.size;

            if let Some(parent) = file.path.parent() {
                *per_directory.entry(parent).or_default() += 1;
            }
        }

        let cap = config.max_files_per_directory as usize;
        let mut crowded: Vec<CrowdedDirectory> = per_directory
            .into_iter()
            .filter(|(_, files)| *files > cap)
            .map(|(path, files)| CrowdedDirectory {
                path: path.to_path_buf(),
                files,
            })
            .collect();
        crowded.sort_by(|a, b| a.path.cmp(&b.path));
        for directory in &crowded {
            tracing::warn!(
                "{} holds {} files (soft limit {})",
                directory.path,
                directory.files,
                cap
            );
        }
        stats.crowded_directories = crowded;

        stats
    }

    /// Delete artifacts older than the configured retention.
    pub fn cleanup(&self, now: DateTime<Local>) -> CleanupReport {
        self.cleanup_with(now, &CleanupOptions::default())
    }

    /// Best-effort sweep over a snapshot of the output tree.
    ///
    /// Deletes every PDF whose modification time is strictly older than
    /// `now - days`. Files created after the snapshot are never considered.
    /// A failed deletion is recorded and the sweep continues. Afterwards,
    /// empty directories that were already older than the cutoff are pruned.
    pub fn cleanup_with(&self, now: DateTime<Local>, options: &CleanupOptions) -> CleanupReport {
        let config = self.configuration();
        let days = options.older_than_days.unwrap_or(config.auto_cleanup_days);
        if days == 0 {
            tracing::debug!("Cleanup disabled (retention 0 days)");
            return CleanupReport::default();
        }
        let Some(cutoff) = now.checked_sub_signed(TimeDelta::days(i64::from(days))) else {
            tracing::debug!("Retention of {} days reaches before the calendar start", days);
            return CleanupReport::default();
        };

        let root = &config.base_output_dir;
        let kinds = options.kinds.as_deref();
        let scan = Scan::take(root);

        tracing::info!(
            "Cleanup sweep of {} ({} files, cutoff {})",
            root,
            scan.files.len(),
            cutoff.format("%Y-%m-%d %H:%M:%S")
        );

        let mut report = CleanupReport {
            cutoff: Some(cutoff),
            skipped: scan.inaccessible,
            ..CleanupReport::default()
        };

        for file in &scan.files {
            if !in_scope(&file.relative, kinds) || file.modified >= cutoff {
                report.skipped += 1;
                continue;
            }

            match fs::remove_file(&file.path) {
                Ok(()) => {
                    tracing::debug!("Removed expired artifact {}", file.path);
                    report.deleted += 1;
                    report.bytes_freed += file.size;
                }
                // Removed by someone else since the snapshot
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", file.path, e);
                    report.failed.push(CleanupFailure {
                        path: file.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.removed_directories = Self::prune_empty_directories(&scan, cutoff, kinds);

        tracing::info!(
            "Cleanup finished: {} deleted ({} bytes), {} skipped, {} failed, {} directories removed",
            report.deleted,
            report.bytes_freed,
            report.skipped,
            report.failed.len(),
            report.removed_directories
        );
        report
    }

    /// Remove empty directories, deepest first. Only directories whose
    /// snapshot modification time predates the cutoff are candidates, so a
    /// directory just materialized for an in-flight operation is left alone.
    fn prune_empty_directories(
        scan: &Scan,
        cutoff: DateTime<Local>,
        kinds: Option<&[OperationKind]>,
    ) -> usize {
        let mut candidates: Vec<&ScannedDirectory> = scan
            .directories
            .iter()
            .filter(|dir| dir.modified.is_some_and(|modified| modified < cutoff))
            .filter(|dir| in_scope(&dir.relative, kinds))
            .collect();
        candidates.sort_by(|a, b| b.depth.cmp(&a.depth));

        let mut removed = 0;
        for dir in candidates {
            let is_empty = fs::read_dir(&dir.path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty && fs::remove_dir(&dir.path).is_ok() {
                tracing::debug!("Removed empty directory {}", dir.path);
                removed += 1;
            }
        }
        removed
    }

    /// Statistics plus a flat listing of every artifact.
    pub fn inventory(&self) -> Inventory {
        let config = self.configuration();
        let scan = Scan::take(&config.base_output_dir);
        let summary = Self::summarize(&config, &scan);

        let mut files: Vec<InventoryEntry> = scan
            .files
            .into_iter()
            .map(|file| InventoryEntry {
                path: file.relative,
                kind: file.kind,
                size_bytes: file.size,
                modified_at: file.modified,
            })
            .collect();
        files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

        Inventory {
            exported_at: Local::now(),
            base_directory: config.base_output_dir.clone(),
            summary,
            files,
        }
    }

    /// Export the inventory to `<root>/file_list.json`.
    pub fn export_inventory(&self) -> Result<Utf8PathBuf> {
        let target = self.base_dir().join(INVENTORY_FILE_NAME);
        self.export_inventory_to(&target)
    }

    /// Export the inventory to `target`, replacing it atomically.
    ///
    /// The JSON is written to a temporary file in the target directory and
    /// renamed into place, so a crash never leaves a truncated inventory
    /// under the canonical name.
    pub fn export_inventory_to(&self, target: &Utf8Path) -> Result<Utf8PathBuf> {
        let inventory = self.inventory();
        let json = serde_json::to_vec_pretty(&inventory).context("Failed to serialize inventory")?;

        let parent = match target.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        self.ensure_directory(parent)?;

        let mut temp = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary inventory in {}", parent))?;
        temp.write_all(&json)
            .with_context(|| format!("Failed to write inventory for {}", target))?;
        temp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync inventory for {}", target))?;
        temp.persist(target)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move inventory into place: {}", target))?;

        tracing::info!(
            "Exported inventory of {} files to {}",
            inventory.files.len(),
            target
        );
        Ok(target.to_path_buf())
    }
}
