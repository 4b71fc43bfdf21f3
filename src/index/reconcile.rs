//! Index reconciliation
//!
//! Maintenance passes that re-align an index with the files under its
//! storage root. Each pass is idempotent and can run on its own. None of
//! them may run while a test run is mutating the same store.

use crate::index::path::{entry_path, generated_id_from_file_name, subject_dir};
use crate::index::store::{IndexFormat, IndexStore};
use crate::index::types::{CompositeKey, IndexEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use std::sync::Arc;
use walkdir::WalkDir;

/// Which entries count as duplicates of each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicatePolicy {
    /// Same subject key, whatever the browser/viewport
    #[default]
    SubjectKey,
    /// Same subject key, browser and viewport
    CompositeKey,
}

impl DuplicatePolicy {
    fn group_key<E: IndexEntry>(&self, entry: &E) -> CompositeKey {
        match self {
            DuplicatePolicy::SubjectKey => CompositeKey::new(entry.subject_key()),
            DuplicatePolicy::CompositeKey => entry.composite_key(),
        }
    }
}

/// Which passes a cleanup runs. Selecting nothing selects everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupOptions {
    /// Orphaned entries and orphaned files
    pub orphans: bool,
    pub duplicates: bool,
    /// Subjects missing from the catalog; needs the catalog's keys
    pub stale: bool,
    /// Treat entries as duplicates only when browser and viewport match too
    pub by_configuration: bool,
}

impl CleanupOptions {
    pub fn all() -> Self {
        Self {
            orphans: true,
            duplicates: true,
            stale: true,
            by_configuration: false,
        }
    }

    /// Resolve "nothing selected" to every pass
    pub fn resolved(self) -> Self {
        if self.orphans || self.duplicates || self.stale {
            self
        } else {
            Self {
                by_configuration: self.by_configuration,
                ..Self::all()
            }
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        if self.by_configuration {
            DuplicatePolicy::CompositeKey
        } else {
            DuplicatePolicy::SubjectKey
        }
    }
}

/// What a pass deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub entries_removed: usize,
    pub files_removed: usize,
    pub dirs_removed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.entries_removed == 0 && self.files_removed == 0 && self.dirs_removed == 0
    }
}

impl std::ops::AddAssign for CleanupReport {
    fn add_assign(&mut self, other: Self) {
        self.entries_removed += other.entries_removed;
        self.files_removed += other.files_removed;
        self.dirs_removed += other.dirs_removed;
    }
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entries, {} files, {} directories removed",
            self.entries_removed, self.files_removed, self.dirs_removed
        )
    }
}

/// Two hex characters: the shard directories of an earlier on-disk layout
fn is_hex_shard(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// First directory component a subject's files live under
fn top_level_dir(subject_key: &str) -> Option<String> {
    subject_dir(subject_key)
        .components()
        .next()
        .and_then(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
}

/// Runs cleanup passes against one index store and its storage root
pub struct Reconciler<E: IndexEntry> {
    store: Arc<IndexStore<E>>,
}

impl<E: IndexEntry> Reconciler<E> {
    pub fn new(store: Arc<IndexStore<E>>) -> Self {
        Self { store }
    }

    fn root(&self) -> &Path {
        self.store.root()
    }

    /// Delete the image files backing an entry. Returns how many existed.
    fn delete_files(&self, entry: &E) -> usize {
        let mut removed = 0;
        for kind in E::FILE_KINDS {
            let path = self.store.file_path(entry, *kind);
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove file"),
            }
        }
        removed
    }

    /// Drop entries none of whose backing files exist.
    ///
    /// Disposable entries (passing results) are dropped unconditionally.
    pub async fn cleanup_orphaned_entries(&self) -> CleanupReport {
        let root = self.root().to_path_buf();
        let orphaned: HashSet<CompositeKey> = self
            .store
            .get_all_entries()
            .await
            .iter()
            .filter(|e| {
                e.is_disposable()
                    || !E::FILE_KINDS.iter().any(|kind| {
                        entry_path(&root, *kind, e.generated_id(), Some(e.subject_key())).exists()
                    })
            })
            .map(|e| e.composite_key())
            .collect();

        if orphaned.is_empty() {
            return CleanupReport::default();
        }

        let removed = self
            .store
            .remove_where(|e| orphaned.contains(&e.composite_key()))
            .await;

        tracing::info!(index = E::INDEX_NAME, removed = removed.len(), "Removed orphaned entries");

        CleanupReport {
            entries_removed: removed.len(),
            ..Default::default()
        }
    }

    /// Delete image files no entry references, then prune empty directories.
    ///
    /// Also removes obsolete hex shard directories and temp files left by
    /// interrupted index writes. The storage root itself is never removed.
    pub async fn cleanup_orphaned_files(&self) -> CleanupReport {
        let entries = self.store.get_all_entries().await;
        let live_ids: HashSet<&str> = entries.iter().map(|e| e.generated_id()).collect();
        let live_dirs: HashSet<String> = entries
            .iter()
            .filter_map(|e| top_level_dir(e.subject_key()))
            .collect();

        let root = self.root().to_path_buf();
        let own_temp_suffix = format!(".tmp.{}", std::process::id());
        let mut report = CleanupReport::default();

        // Obsolete shard directories
        if let Ok(read_dir) = std::fs::read_dir(&root) {
            for dir_entry in read_dir.flatten() {
                let path = dir_entry.path();
                let name = dir_entry.file_name().to_string_lossy().to_string();
                if !path.is_dir() || !is_hex_shard(&name) || live_dirs.contains(&name) {
                    continue;
                }

                let (files, dirs) = WalkDir::new(&path)
                    .into_iter()
                    .filter_map(Result::ok)
                    .fold((0, 0), |(f, d), e| {
                        if e.file_type().is_dir() {
                            (f, d + 1)
                        } else {
                            (f + 1, d)
                        }
                    });

                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        tracing::debug!(path = ?path, "Removed obsolete shard directory");
                        report.files_removed += files;
                        report.dirs_removed += dirs;
                    }
                    Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove shard directory"),
                }
            }
        }

        // Unreferenced images and stale temp files
        for dir_entry in WalkDir::new(&root).min_depth(1) {
            let dir_entry = match dir_entry {
                Ok(dir_entry) => dir_entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable path");
                    continue;
                }
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }

            let name = dir_entry.file_name().to_string_lossy();
            let is_stale_temp = [IndexFormat::Json, IndexFormat::Jsonl].iter().any(|f| {
                name.starts_with(&format!("{}.tmp.", f.file_name()))
            }) && !name.ends_with(&own_temp_suffix);

            let orphaned = match generated_id_from_file_name(&name) {
                Some(id) => !live_ids.contains(id),
                None => false,
            };

            if orphaned || is_stale_temp {
                match std::fs::remove_file(dir_entry.path()) {
                    Ok(()) => report.files_removed += 1,
                    Err(e) => tracing::warn!(path = ?dir_entry.path(), error = %e, "Failed to remove file"),
                }
            }
        }

        // Empty directories, deepest first
        for dir_entry in WalkDir::new(&root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !dir_entry.file_type().is_dir() {
                continue;
            }
            let is_empty = std::fs::read_dir(dir_entry.path())
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if is_empty && std::fs::remove_dir(dir_entry.path()).is_ok() {
                report.dirs_removed += 1;
            }
        }

        if !report.is_empty() {
            tracing::info!(index = E::INDEX_NAME, %report, "Removed orphaned files");
        }
        report
    }

    /// Collapse entries sharing a primary key, keeping the most recently updated
    pub async fn cleanup_duplicate_entries(&self, policy: DuplicatePolicy) -> CleanupReport {
        let entries = self.store.get_all_entries().await;

        let mut groups: HashMap<CompositeKey, Vec<&E>> = HashMap::new();
        for entry in &entries {
            groups.entry(policy.group_key(entry)).or_default().push(entry);
        }

        let mut drop_keys = HashSet::new();
        let mut keeper_ids = HashSet::new();
        for group in groups.values().filter(|g| g.len() > 1) {
            let Some(keeper) = group.iter().max_by_key(|e| e.recency()) else {
                continue;
            };
            keeper_ids.insert(keeper.generated_id().to_string());
            for entry in group {
                if entry.composite_key() != keeper.composite_key() {
                    drop_keys.insert(entry.composite_key());
                }
            }
        }

        if drop_keys.is_empty() {
            return CleanupReport::default();
        }

        let removed = self
            .store
            .remove_where(|e| drop_keys.contains(&e.composite_key()))
            .await;

        let mut report = CleanupReport {
            entries_removed: removed.len(),
            ..Default::default()
        };
        for entry in removed.iter().filter(|e| !keeper_ids.contains(e.generated_id())) {
            report.files_removed += self.delete_files(entry);
        }

        tracing::info!(index = E::INDEX_NAME, ?policy, %report, "Removed duplicate entries");
        report
    }

    /// Drop entries (and their files) for subjects no longer in the catalog.
    ///
    /// An empty catalog is treated as a discovery problem and removes nothing.
    pub async fn cleanup_stale_subjects(&self, valid_keys: &HashSet<String>) -> CleanupReport {
        if valid_keys.is_empty() {
            tracing::warn!(index = E::INDEX_NAME, "Catalog is empty, skipping stale subject cleanup");
            return CleanupReport::default();
        }

        let removed = self
            .store
            .remove_where(|e| !valid_keys.contains(e.subject_key()))
            .await;

        let mut report = CleanupReport {
            entries_removed: removed.len(),
            ..Default::default()
        };
        for entry in &removed {
            report.files_removed += self.delete_files(entry);
        }

        if !report.is_empty() {
            tracing::info!(index = E::INDEX_NAME, %report, "Removed stale subjects");
        }
        report
    }

    /// Run every pass: duplicates, stale subjects (when a catalog is given),
    /// orphaned entries, then orphaned files.
    pub async fn run_all(&self, valid_keys: Option<&HashSet<String>>, policy: DuplicatePolicy) -> CleanupReport {
        let mut report = self.cleanup_duplicate_entries(policy).await;
        if let Some(valid_keys) = valid_keys {
            report += self.cleanup_stale_subjects(valid_keys).await;
        }
        report += self.cleanup_orphaned_entries().await;
        report += self.cleanup_orphaned_files().await;
        report
    }

    /// Run the passes `options` selects, in the same order as [`Reconciler::run_all`].
    /// The stale pass is skipped when no catalog keys are given.
    pub async fn run(&self, options: CleanupOptions, valid_keys: Option<&HashSet<String>>) -> CleanupReport {
        let options = options.resolved();
        let mut report = CleanupReport::default();

        if options.duplicates {
            report += self.cleanup_duplicate_entries(options.policy()).await;
        }
        if options.stale {
            match valid_keys {
                Some(valid_keys) => report += self.cleanup_stale_subjects(valid_keys).await,
                None => tracing::debug!(index = E::INDEX_NAME, "No catalog keys, skipping stale subjects"),
            }
        }
        if options.orphans {
            report += self.cleanup_orphaned_entries().await;
            report += self.cleanup_orphaned_files().await;
        }
        report
    }
}
