//! Storyshot Index Store
//!
//! Two persistent indexes map every subject to the generated id that names
//! its files on disk:
//!
//! - **Snapshots**: subject → baseline image id (`<snapshotDir>/index.json`)
//! - **Results**: subject → latest non-passing verdict (`<resultsDir>/index.json`)
//!
//! # Architecture
//!
//! ```text
//! get_or_create_id / set_entry / remove_where
//!        ↓
//! In-memory entries + lookup (one mutex)
//!        ↓ pending keys
//! Writer task: debounce window, or pending cap → write now
//!        ↓
//! index.json.tmp.<pid> → fsync → rename over index.json
//! ```
//!
//! The [`Reconciler`] repairs drift between an index and its directory tree:
//! duplicate keys, subjects gone from the catalog, entries without files and
//! files without entries.

mod error;
mod path;
mod reconcile;
mod store;
mod types;

pub use error::{IndexError, IndexResult};
pub use path::{entry_path, generated_id_from_file_name, sanitize_segment, subject_dir, VARIANT_SEPARATOR};
pub use reconcile::{CleanupOptions, CleanupReport, DuplicatePolicy, Reconciler};
pub use store::{IndexFormat, IndexStats, IndexStore, IndexStoreConfig};
pub use types::{
    CompositeKey, FileKind, IndexDocument, IndexEntry, ResultEntry, ResultMetrics, ResultStatus,
    SnapshotEntry, INDEX_VERSION,
};

/// Snapshot index: subject → baseline id
pub type SnapshotIndex = IndexStore<SnapshotEntry>;

/// Results index: subject → latest verdict
pub type ResultsIndex = IndexStore<ResultEntry>;
