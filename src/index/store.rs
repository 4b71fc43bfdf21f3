//! Index Store
//!
//! Durable mapping from a subject's composite key to the generated id that
//! names its files on disk.
//!
//! - Mutation path: caller → state lock → pending set → writer signal
//! - Write path: debounce timer (or pending cap) → write lane → temp file → rename
//!
//! All mutations go through one `tokio::sync::Mutex` around the in-memory
//! state. Writes go through a second mutex (the write lane) shared by the
//! background writer and `flush()`, so only one task ever renames over the
//! index file. The whole index is serialized on every write, so whatever
//! reaches disk last is a complete document.

use crate::index::error::{IndexError, IndexResult};
use crate::index::path::entry_path;
use crate::index::types::{
    CompositeKey, FileKind, IndexDocument, IndexEntry, ResultEntry, ResultMetrics, ResultStatus,
    INDEX_VERSION,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use uuid::Uuid;

/// On-disk layout of an index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexFormat {
    /// Single pretty-printed `index.json` document
    #[default]
    Json,
    /// `index.jsonl`: version header line, then one entry per line sorted by key
    Jsonl,
}

impl IndexFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            IndexFormat::Json => "index.json",
            IndexFormat::Jsonl => "index.jsonl",
        }
    }

    fn other(&self) -> IndexFormat {
        match self {
            IndexFormat::Json => IndexFormat::Jsonl,
            IndexFormat::Jsonl => IndexFormat::Json,
        }
    }
}

impl std::str::FromStr for IndexFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(IndexFormat::Json),
            "jsonl" | "ndjson" => Ok(IndexFormat::Jsonl),
            other => Err(format!("unknown index format: {}", other)),
        }
    }
}

/// Configuration for an index store
#[derive(Debug, Clone)]
pub struct IndexStoreConfig {
    /// Quiet period after the last mutation before a write is issued
    pub debounce: Duration,
    /// Pending mutations that force a write without waiting for the timer
    pub max_pending: usize,
    /// File layout
    pub format: IndexFormat,
}

impl IndexStoreConfig {
    /// Defaults for the snapshot index (mutated once per new subject)
    pub fn snapshots() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_pending: 100,
            format: IndexFormat::Json,
        }
    }

    /// Defaults for the results index (mutated once per tested subject)
    pub fn results() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            max_pending: 50,
            format: IndexFormat::Json,
        }
    }

    /// Builder method: set debounce window
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Builder method: set pending cap
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Builder method: set file format
    pub fn format(mut self, format: IndexFormat) -> Self {
        self.format = format;
        self
    }
}

impl Default for IndexStoreConfig {
    fn default() -> Self {
        Self::snapshots()
    }
}

/// Index statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: usize,
    pub pending: usize,
    pub writes: u64,
    pub failed_writes: u64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Entries: {}, Pending: {}, Writes: {}, Failed writes: {}",
            self.entries, self.pending, self.writes, self.failed_writes
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSignal {
    /// Re-arm the debounce timer
    Schedule,
    /// Pending cap reached, write without waiting
    Now,
}

/// In-memory index: ordered entries plus lookup maps into them
struct IndexState<E> {
    entries: Vec<E>,
    /// Composite key → position in `entries`
    lookup: HashMap<CompositeKey, usize>,
    /// Subject key → positions in `entries`
    by_subject: HashMap<String, Vec<usize>>,
    /// Keys mutated since the last successful write
    pending: HashSet<CompositeKey>,
    /// Index file in the other format, removed after the next successful write
    migrate_from: Option<PathBuf>,
}

impl<E: IndexEntry> IndexState<E> {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            lookup: HashMap::new(),
            by_subject: HashMap::new(),
            pending: HashSet::new(),
            migrate_from: None,
        }
    }

    /// Build from a loaded document, collapsing duplicate composite keys to
    /// the most recently updated entry. Returns the number collapsed.
    fn from_entries(loaded: Vec<E>) -> (Self, usize) {
        let mut state = Self::empty();
        let mut collapsed = 0;

        for entry in loaded {
            let key = entry.composite_key();
            match state.lookup.get(&key).copied() {
                Some(idx) => {
                    collapsed += 1;
                    if entry.recency() > state.entries[idx].recency() {
                        state.entries[idx] = entry;
                    }
                }
                None => {
                    state.lookup.insert(key, state.entries.len());
                    state.entries.push(entry);
                }
            }
        }

        state.rebuild_lookup();
        (state, collapsed)
    }

    fn rebuild_lookup(&mut self) {
        self.lookup.clear();
        self.by_subject.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.lookup.insert(entry.composite_key(), idx);
            self.by_subject
                .entry(entry.subject_key().to_string())
                .or_default()
                .push(idx);
        }
    }

    fn get(&self, key: &CompositeKey) -> Option<&E> {
        self.lookup.get(key).map(|&idx| &self.entries[idx])
    }

    fn insert(&mut self, entry: E) {
        let key = entry.composite_key();
        let idx = self.entries.len();
        self.by_subject
            .entry(key.subject_key.clone())
            .or_default()
            .push(idx);
        self.lookup.insert(key.clone(), idx);
        self.entries.push(entry);
        self.pending.insert(key);
    }

    /// Find an entry for the same subject that is less specific than `key`:
    /// every browser/viewport it has set matches the request.
    fn find_adoptable(&self, key: &CompositeKey) -> Option<usize> {
        let candidates = self.by_subject.get(&key.subject_key)?;
        candidates.iter().copied().find(|&idx| {
            let entry = &self.entries[idx];
            let browser_ok = entry.browser().is_none() || entry.browser() == key.browser.as_deref();
            let viewport_ok = entry.viewport_name().is_none()
                || entry.viewport_name() == key.viewport_name.as_deref();
            browser_ok && viewport_ok
        })
    }

    fn retain<F: FnMut(&E) -> bool>(&mut self, mut keep: F) -> Vec<E> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if keep(&entry) {
                kept.push(entry);
            } else {
                removed.push(entry);
            }
        }
        self.entries = kept;

        if !removed.is_empty() {
            for entry in &removed {
                self.pending.insert(entry.composite_key());
            }
            self.rebuild_lookup();
        }
        removed
    }

    fn encode(&self, format: IndexFormat) -> IndexResult<Vec<u8>> {
        match format {
            IndexFormat::Json => {
                #[derive(Serialize)]
                struct DocumentRef<'a, T> {
                    version: u32,
                    entries: &'a [T],
                }

                let doc = DocumentRef {
                    version: INDEX_VERSION,
                    entries: &self.entries,
                };
                let mut bytes = serde_json::to_vec_pretty(&doc)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
            IndexFormat::Jsonl => {
                let mut sorted: Vec<&E> = self.entries.iter().collect();
                sorted.sort_by_cached_key(|e| e.composite_key());

                let mut bytes = serde_json::to_vec(&serde_json::json!({ "version": INDEX_VERSION }))?;
                bytes.push(b'\n');
                for entry in sorted {
                    serde_json::to_writer(&mut bytes, entry)?;
                    bytes.push(b'\n');
                }
                Ok(bytes)
            }
        }
    }
}

/// Parse an index file in the given format
fn decode<E: IndexEntry>(path: &Path, content: &str, format: IndexFormat) -> IndexResult<IndexDocument<E>> {
    let corrupt = |reason: String| IndexError::Corruption {
        path: path.to_path_buf(),
        reason,
    };

    let doc = match format {
        IndexFormat::Json => {
            serde_json::from_str::<IndexDocument<E>>(content).map_err(|e| corrupt(e.to_string()))?
        }
        IndexFormat::Jsonl => {
            #[derive(Deserialize)]
            struct Header {
                version: u32,
            }

            let mut lines = content.lines().filter(|l| !l.trim().is_empty());
            let header: Header = match lines.next() {
                Some(line) => serde_json::from_str(line).map_err(|e| corrupt(e.to_string()))?,
                None => return Ok(IndexDocument::default()),
            };

            let mut entries = Vec::new();
            for (n, line) in lines.enumerate() {
                let entry = serde_json::from_str::<E>(line)
                    .map_err(|e| corrupt(format!("line {}: {}", n + 2, e)))?;
                entries.push(entry);
            }

            IndexDocument {
                version: header.version,
                entries,
            }
        }
    };

    if doc.version > INDEX_VERSION {
        return Err(IndexError::UnsupportedVersion {
            found: doc.version,
            supported: INDEX_VERSION,
        });
    }

    Ok(doc)
}

/// Temp file used while writing `path`; same directory so rename stays atomic
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "index".to_string());
    path.with_file_name(format!("{}.tmp.{}", name, std::process::id()))
}

/// Write `bytes` to a temp file, fsync it, then rename it over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// State shared between the store handle and its writer task
struct Shared<E> {
    root: PathBuf,
    path: PathBuf,
    config: IndexStoreConfig,
    state: Mutex<IndexState<E>>,
    write_lane: Mutex<()>,
    writes: AtomicU64,
    failed_writes: AtomicU64,
}

impl<E: IndexEntry> Shared<E> {
    /// Write the full index if anything is pending.
    ///
    /// Returns `Ok(false)` when there was nothing to write. On failure the
    /// drained keys go back into the pending set.
    async fn write_pending(&self) -> IndexResult<bool> {
        let _lane = self.write_lane.lock().await;

        let (bytes, drained, migrate_from) = {
            let mut state = self.state.lock().await;
            if state.pending.is_empty() {
                return Ok(false);
            }
            let bytes = state.encode(self.config.format)?;
            let drained = std::mem::take(&mut state.pending);
            (bytes, drained, state.migrate_from.clone())
        };

        match write_atomic(&self.path, &bytes).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    index = E::INDEX_NAME,
                    path = ?self.path,
                    updates = drained.len(),
                    bytes = bytes.len(),
                    "Index written"
                );

                if let Some(old) = migrate_from {
                    match tokio::fs::remove_file(&old).await {
                        Ok(()) => tracing::info!(index = E::INDEX_NAME, from = ?old, "Migrated index format"),
                        Err(e) => tracing::warn!(index = E::INDEX_NAME, from = ?old, error = %e, "Failed to remove old index file"),
                    }
                    self.state.lock().await.migrate_from = None;
                }
                Ok(true)
            }
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                self.state.lock().await.pending.extend(drained);
                Err(IndexError::WriteFailed {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Background writer: debounces `Schedule` signals, writes immediately on `Now`
async fn run_writer<E: IndexEntry>(shared: Arc<Shared<E>>, mut rx: mpsc::UnboundedReceiver<WriteSignal>) {
    while let Some(signal) = rx.recv().await {
        if signal == WriteSignal::Schedule {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(shared.config.debounce) => break,
                    next = rx.recv() => match next {
                        Some(WriteSignal::Schedule) => continue,
                        Some(WriteSignal::Now) | None => break,
                    },
                }
            }
        }

        if let Err(e) = shared.write_pending().await {
            tracing::error!(
                index = E::INDEX_NAME,
                error = %e,
                "Index write failed, keeping updates pending"
            );
        }
    }

    tracing::trace!(index = E::INDEX_NAME, "Index writer stopped");
}

/// Persistent index of entries keyed by composite key
pub struct IndexStore<E: IndexEntry> {
    shared: Arc<Shared<E>>,
    signal: mpsc::UnboundedSender<WriteSignal>,
}

impl<E: IndexEntry> IndexStore<E> {
    /// Open (or create) the index stored under `root`.
    ///
    /// A missing index starts empty. A corrupt or unsupported one is logged
    /// and discarded; the next write replaces it.
    pub async fn open(root: impl Into<PathBuf>, config: IndexStoreConfig) -> IndexResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let path = root.join(config.format.file_name());
        let alternate = root.join(config.format.other().file_name());

        let (source, format) = if path.exists() {
            (Some(path.clone()), config.format)
        } else if alternate.exists() {
            (Some(alternate.clone()), config.format.other())
        } else {
            (None, config.format)
        };

        let state = match source {
            None => IndexState::empty(),
            Some(source) => Self::load(&source, format, &path).await,
        };

        tracing::info!(
            index = E::INDEX_NAME,
            path = ?path,
            entries = state.entries.len(),
            "Index loaded"
        );

        let shared = Arc::new(Shared {
            root,
            path,
            config,
            state: Mutex::new(state),
            write_lane: Mutex::new(()),
            writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        });

        let (signal, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&shared), rx));

        let store = Self { shared, signal };

        let pending = store.shared.state.lock().await.pending.len();
        if pending > 0 {
            store.schedule(pending);
        }

        Ok(store)
    }

    async fn load(source: &Path, format: IndexFormat, target: &Path) -> IndexState<E> {
        let content = match tokio::fs::read_to_string(source).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(index = E::INDEX_NAME, path = ?source, error = %e, "Unreadable index, starting fresh");
                return IndexState::empty();
            }
        };

        let doc = match decode::<E>(source, &content, format) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(index = E::INDEX_NAME, error = %e, "Discarding index, starting fresh");
                return IndexState::empty();
            }
        };

        let (mut state, collapsed) = IndexState::from_entries(doc.entries);
        if collapsed > 0 {
            tracing::warn!(index = E::INDEX_NAME, collapsed, "Collapsed duplicate index entries on load");
        }

        // Rewrite the whole document when it needs cleaning or migrating
        if collapsed > 0 || source != target {
            state.pending = state.lookup.keys().cloned().collect();
        }
        if source != target {
            state.migrate_from = Some(source.to_path_buf());
        }

        state
    }

    /// Storage root this index lives in
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Path of the index file
    pub fn index_path(&self) -> &Path {
        &self.shared.path
    }

    /// Return the id for a key, creating an entry if none exists.
    ///
    /// An existing entry for the same subject whose browser/viewport are
    /// unset (or already equal) is adopted: the missing fields are filled in
    /// and its id is kept.
    pub async fn get_or_create_id(
        &self,
        subject_key: &str,
        browser: Option<&str>,
        viewport_name: Option<&str>,
    ) -> String {
        let key = CompositeKey::with_target(
            subject_key,
            browser.map(str::to_string),
            viewport_name.map(str::to_string),
        );

        let (id, pending) = {
            let mut state = self.shared.state.lock().await;

            if let Some(entry) = state.get(&key) {
                return entry.generated_id().to_string();
            }

            let now = Utc::now();
            let id = match state.find_adoptable(&key) {
                Some(idx) => {
                    let old_key = state.entries[idx].composite_key();
                    state.entries[idx].retarget(key.browser.clone(), key.viewport_name.clone(), now);
                    state.lookup.remove(&old_key);
                    state.lookup.insert(key.clone(), idx);
                    state.pending.insert(old_key);
                    state.pending.insert(key.clone());
                    tracing::debug!(index = E::INDEX_NAME, key = %key, "Retargeted index entry");
                    state.entries[idx].generated_id().to_string()
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    state.insert(E::create(&key, id.clone(), now));
                    tracing::debug!(index = E::INDEX_NAME, key = %key, id = %id, "Created index entry");
                    id
                }
            };

            (id, state.pending.len())
        };

        self.schedule(pending);
        id
    }

    /// Look up an entry by composite key
    pub async fn get(&self, key: &CompositeKey) -> Option<E> {
        self.shared.state.lock().await.get(key).cloned()
    }

    /// Look up an entry by generated id
    pub async fn find_by_id(&self, generated_id: &str) -> Option<E> {
        let state = self.shared.state.lock().await;
        state
            .entries
            .iter()
            .find(|e| e.generated_id() == generated_id)
            .cloned()
    }

    /// Remove one entry
    pub async fn remove_entry(&self, key: &CompositeKey) -> Option<E> {
        self.remove_where(|e| e.composite_key() == *key).await.into_iter().next()
    }

    /// Remove every entry matching `predicate`, returning what was removed
    pub async fn remove_where<F: FnMut(&E) -> bool>(&self, mut predicate: F) -> Vec<E> {
        let (removed, pending) = {
            let mut state = self.shared.state.lock().await;
            let removed = state.retain(|e| !predicate(e));
            (removed, state.pending.len())
        };

        if !removed.is_empty() {
            self.schedule(pending);
        }
        removed
    }

    /// Point-in-time copy of all entries, in on-disk order
    pub async fn get_all_entries(&self) -> Vec<E> {
        self.shared.state.lock().await.entries.clone()
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.entries.len()
    }

    /// Whether the index has no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Path of an entry's file. Pure; does not touch disk.
    pub fn get_path(&self, generated_id: &str, base_path: &Path, kind: FileKind, subject_key: Option<&str>) -> PathBuf {
        entry_path(base_path, kind, generated_id, subject_key)
    }

    /// Path of an entry's file under this store's root
    pub fn file_path(&self, entry: &E, kind: FileKind) -> PathBuf {
        entry_path(&self.shared.root, kind, entry.generated_id(), Some(entry.subject_key()))
    }

    /// Get index statistics
    pub async fn stats(&self) -> IndexStats {
        let state = self.shared.state.lock().await;
        IndexStats {
            entries: state.entries.len(),
            pending: state.pending.len(),
            writes: self.shared.writes.load(Ordering::Relaxed),
            failed_writes: self.shared.failed_writes.load(Ordering::Relaxed),
        }
    }

    /// Write until nothing is pending.
    ///
    /// Waits for an in-flight write by queueing on the write lane, then keeps
    /// writing while mutations that arrived meanwhile are still pending.
    pub async fn flush(&self) -> IndexResult<()> {
        while self.shared.write_pending().await? {}
        Ok(())
    }

    fn schedule(&self, pending: usize) {
        let signal = if pending >= self.shared.config.max_pending {
            WriteSignal::Now
        } else {
            WriteSignal::Schedule
        };

        if self.signal.send(signal).is_err() {
            tracing::warn!(index = E::INDEX_NAME, "Index writer gone, updates stay pending until flush");
        }
    }
}

impl IndexStore<ResultEntry> {
    /// Record a verdict for a subject, keeping the entry's original `created_at`
    pub async fn set_entry(
        &self,
        subject_key: &str,
        generated_id: &str,
        status: ResultStatus,
        metrics: ResultMetrics,
    ) {
        let key = CompositeKey::with_target(
            subject_key,
            metrics.browser.clone(),
            metrics.viewport_name.clone(),
        );

        let pending = {
            let mut state = self.shared.state.lock().await;
            let now = Utc::now();

            match state.lookup.get(&key).copied() {
                Some(idx) => {
                    state.entries[idx].apply(generated_id, status, metrics, now);
                    state.pending.insert(key);
                }
                None => {
                    let mut entry = ResultEntry::create(&key, generated_id.to_string(), now);
                    entry.apply(generated_id, status, metrics, now);
                    state.insert(entry);
                }
            }

            state.pending.len()
        };

        self.schedule(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::SnapshotEntry;
    use tempfile::tempdir;

    fn fast_config() -> IndexStoreConfig {
        IndexStoreConfig::snapshots()
            .debounce(Duration::from_millis(50))
            .max_pending(1000)
    }

    async fn snapshot_store(root: &Path) -> IndexStore<SnapshotEntry> {
        IndexStore::open(root, fast_config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        let first = store.get_or_create_id("button--primary", None, None).await;
        let second = store.get_or_create_id("button--primary", None, None).await;

        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_targets_get_distinct_ids() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        let chromium = store
            .get_or_create_id("button--primary", Some("chromium"), Some("desktop"))
            .await;
        let webkit = store
            .get_or_create_id("button--primary", Some("webkit"), Some("desktop"))
            .await;

        assert_ne!(chromium, webkit);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_untargeted_entry_is_adopted() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        let id = store.get_or_create_id("button--primary", None, None).await;
        let adopted = store
            .get_or_create_id("button--primary", Some("chromium"), Some("mobile"))
            .await;

        assert_eq!(id, adopted);
        assert_eq!(store.len().await, 1);

        let entry = store
            .get(&CompositeKey::new("button--primary").browser("chromium").viewport("mobile"))
            .await
            .unwrap();
        assert_eq!(entry.generated_id, id);
        assert!(store.get(&CompositeKey::new("button--primary")).await.is_none());
    }

    #[tokio::test]
    async fn test_generated_ids_are_not_derived_from_key() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        let id = store.get_or_create_id("a--one", None, None).await;
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(!id.contains("one"));
    }

    #[tokio::test]
    async fn test_persistence_across_sessions() {
        let dir = tempdir().unwrap();

        let id = {
            let store = snapshot_store(dir.path()).await;
            let id = store.get_or_create_id("a--one", None, None).await;
            store.flush().await.unwrap();
            id
        };

        let store = snapshot_store(dir.path()).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_or_create_id("a--one", None, None).await, id);
    }

    #[tokio::test]
    async fn test_debounce_coalesces_writes() {
        let dir = tempdir().unwrap();
        let config = IndexStoreConfig::results()
            .debounce(Duration::from_millis(100))
            .max_pending(1000);
        let store: IndexStore<ResultEntry> = IndexStore::open(dir.path(), config).await.unwrap();

        for i in 0..20 {
            store
                .set_entry(
                    &format!("story--{}", i),
                    &format!("id-{}", i),
                    ResultStatus::Failed,
                    ResultMetrics::default(),
                )
                .await;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = store.stats().await;
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.pending, 0);

        let reopened: IndexStore<ResultEntry> =
            IndexStore::open(dir.path(), IndexStoreConfig::results()).await.unwrap();
        assert_eq!(reopened.len().await, 20);
    }

    #[tokio::test]
    async fn test_pending_cap_writes_immediately() {
        let dir = tempdir().unwrap();
        let config = IndexStoreConfig::snapshots()
            .debounce(Duration::from_secs(60))
            .max_pending(5);
        let store: IndexStore<SnapshotEntry> = IndexStore::open(dir.path(), config).await.unwrap();

        for i in 0..5 {
            store.get_or_create_id(&format!("s--{}", i), None, None).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = store.stats().await;
        assert!(stats.writes >= 1);
        assert!(store.index_path().exists());
    }

    #[tokio::test]
    async fn test_flush_without_pending_does_not_write() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        store.flush().await.unwrap();
        assert_eq!(store.stats().await.writes, 0);
        assert!(!store.index_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_fresh() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), "{\"version\": 1, \"entries\": [").unwrap();

        let store = snapshot_store(dir.path()).await;
        assert!(store.is_empty().await);

        store.get_or_create_id("a--one", None, None).await;
        store.flush().await.unwrap();

        let reopened = snapshot_store(dir.path()).await;
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_newer_version_is_discarded() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.json"),
            r#"{"version": 99, "entries": []}"#,
        )
        .unwrap();

        let store = snapshot_store(dir.path()).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let store = snapshot_store(dir.path()).await;
            store.get_or_create_id("a--one", None, None).await;
            store.flush().await.unwrap();
        }

        // Simulate a crash mid-write: truncated temp file next to the index
        std::fs::write(dir.path().join("index.json.tmp.424242"), "{\"vers").unwrap();

        let store = snapshot_store(dir.path()).await;
        assert_eq!(store.len().await, 1);

        let content = std::fs::read_to_string(store.index_path()).unwrap();
        let doc: IndexDocument<SnapshotEntry> = serde_json::from_str(&content).unwrap();
        assert_eq!(doc.version, INDEX_VERSION);
        assert_eq!(doc.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_get_all_entries_is_a_copy() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;
        store.get_or_create_id("a--one", None, None).await;

        let mut entries = store.get_all_entries().await;
        entries.clear();

        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_entry_preserves_created_at() {
        let dir = tempdir().unwrap();
        let store: IndexStore<ResultEntry> =
            IndexStore::open(dir.path(), IndexStoreConfig::results()).await.unwrap();

        store
            .set_entry("a--two", "id-1", ResultStatus::Failed, ResultMetrics::default())
            .await;
        let first = store.get(&CompositeKey::new("a--two")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        store
            .set_entry(
                "a--two",
                "id-1",
                ResultStatus::Failed,
                ResultMetrics {
                    diff_pixels: Some(120),
                    ..Default::default()
                },
            )
            .await;
        let second = store.get(&CompositeKey::new("a--two")).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.diff_pixels, Some(120));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_load_collapses_duplicate_keys() {
        let dir = tempdir().unwrap();
        let doc = serde_json::json!({
            "version": 1,
            "entries": [
                {
                    "subjectKey": "a--one",
                    "generatedId": "older",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-01-01T00:00:00Z"
                },
                {
                    "subjectKey": "a--one",
                    "generatedId": "newer",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-02-01T00:00:00Z"
                }
            ]
        });
        std::fs::write(dir.path().join("index.json"), doc.to_string()).unwrap();

        let store = snapshot_store(dir.path()).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_or_create_id("a--one", None, None).await, "newer");
    }

    #[tokio::test]
    async fn test_jsonl_is_sorted_by_key() {
        let dir = tempdir().unwrap();
        let config = fast_config().format(IndexFormat::Jsonl);
        let store: IndexStore<SnapshotEntry> = IndexStore::open(dir.path(), config).await.unwrap();

        store.get_or_create_id("b--two", None, None).await;
        store.get_or_create_id("a--one", None, None).await;
        store.flush().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("index.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"version\":1"));
        assert!(lines[1].contains("a--one"));
        assert!(lines[2].contains("b--two"));
    }

    #[tokio::test]
    async fn test_format_migration() {
        let dir = tempdir().unwrap();
        let id = {
            let store = snapshot_store(dir.path()).await;
            let id = store.get_or_create_id("a--one", None, None).await;
            store.flush().await.unwrap();
            id
        };

        let config = fast_config().format(IndexFormat::Jsonl);
        let store: IndexStore<SnapshotEntry> = IndexStore::open(dir.path(), config).await.unwrap();
        assert_eq!(store.get_or_create_id("a--one", None, None).await, id);

        store.flush().await.unwrap();
        assert!(dir.path().join("index.jsonl").exists());
        assert!(!dir.path().join("index.json").exists());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_updates_pending() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        // A directory where the index file should go makes the rename fail
        std::fs::create_dir(dir.path().join("index.json")).unwrap();
        store.get_or_create_id("a--one", None, None).await;

        assert!(store.flush().await.is_err());
        let stats = store.stats().await;
        assert!(stats.pending > 0);
        assert!(stats.failed_writes >= 1);

        std::fs::remove_dir(dir.path().join("index.json")).unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.stats().await.pending, 0);

        let reopened = snapshot_store(dir.path()).await;
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_where() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;
        store.get_or_create_id("a--one", None, None).await;
        store.get_or_create_id("a--two", None, None).await;
        store.get_or_create_id("b--one", None, None).await;

        let removed = store.remove_where(|e| e.subject_key.starts_with("a--")).await;
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len().await, 1);

        // Lookups stay consistent after removal
        assert!(store.get(&CompositeKey::new("b--one")).await.is_some());
        assert!(store.get(&CompositeKey::new("a--one")).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(snapshot_store(dir.path()).await);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create_id("shared--story", None, None).await
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_path_is_pure() {
        let dir = tempdir().unwrap();
        let store = snapshot_store(dir.path()).await;

        let path = store.get_path("abc", Path::new("/base"), FileKind::Diff, Some("x-y--z"));
        assert_eq!(path, PathBuf::from("/base/x/y/abc.diff.png"));
        assert!(!dir.path().join("x").exists());
    }
}
