//! Core data types for the index store
//!
//! This module defines the fundamental types persisted by the two indexes:
//! - `SnapshotEntry`: maps a subject to the id naming its baseline image
//! - `ResultEntry`: the latest verdict recorded for a subject
//! - `CompositeKey`: the uniqueness boundary of an entry
//! - `IndexEntry`: the behaviour the generic store needs from an entry

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Current on-disk index version
pub const INDEX_VERSION: u32 = 1;

/// Uniqueness boundary for an index entry.
///
/// Ordering is lexicographic over (subject, browser, viewport), which is the
/// order the line-delimited format writes entries in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeKey {
    pub subject_key: String,
    pub browser: Option<String>,
    pub viewport_name: Option<String>,
}

impl CompositeKey {
    /// Key for a subject with no browser/viewport narrowing
    pub fn new(subject_key: impl Into<String>) -> Self {
        Self {
            subject_key: subject_key.into(),
            browser: None,
            viewport_name: None,
        }
    }

    /// Key narrowed to a browser and viewport
    pub fn with_target(
        subject_key: impl Into<String>,
        browser: Option<String>,
        viewport_name: Option<String>,
    ) -> Self {
        Self {
            subject_key: subject_key.into(),
            browser,
            viewport_name,
        }
    }

    /// Builder method: set browser
    pub fn browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    /// Builder method: set viewport name
    pub fn viewport(mut self, viewport_name: impl Into<String>) -> Self {
        self.viewport_name = Some(viewport_name.into());
        self
    }

    /// True when neither browser nor viewport is set
    pub fn is_untargeted(&self) -> bool {
        self.browser.is_none() && self.viewport_name.is_none()
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.subject_key)?;
        match (&self.browser, &self.viewport_name) {
            (None, None) => Ok(()),
            (browser, viewport) => write!(
                f,
                " [{}/{}]",
                browser.as_deref().unwrap_or("*"),
                viewport.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// Which image file a path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Stored baseline, lives under the snapshot root
    Baseline,
    /// Latest capture, lives under the results root
    Actual,
    /// Highlighted difference image, lives under the results root
    Diff,
}

impl FileKind {
    /// File name for an entry id
    pub fn file_name(&self, generated_id: &str) -> String {
        match self {
            FileKind::Baseline | FileKind::Actual => format!("{}.png", generated_id),
            FileKind::Diff => format!("{}.diff.png", generated_id),
        }
    }
}

/// Verdict of one capture-and-compare
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// Capture matches the baseline
    Passed,
    /// Capture differs from the baseline, or capturing failed
    Failed,
    /// No baseline existed; the capture became the new baseline
    New,
    /// No baseline existed and none was written
    Missing,
}

impl ResultStatus {
    /// Whether this status counts toward the failure budget
    pub fn is_failure(&self) -> bool {
        matches!(self, ResultStatus::Failed | ResultStatus::Missing)
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Passed => write!(f, "passed"),
            ResultStatus::Failed => write!(f, "failed"),
            ResultStatus::New => write!(f, "new"),
            ResultStatus::Missing => write!(f, "missing"),
        }
    }
}

/// Behaviour the generic index store needs from an entry type
pub trait IndexEntry: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Short name used in log lines
    const INDEX_NAME: &'static str;

    /// Image files backing this entry
    const FILE_KINDS: &'static [FileKind];

    /// Build a fresh entry for a key
    fn create(key: &CompositeKey, generated_id: String, now: DateTime<Utc>) -> Self;

    fn subject_key(&self) -> &str;
    fn browser(&self) -> Option<&str>;
    fn viewport_name(&self) -> Option<&str>;
    fn generated_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;

    /// Replace browser/viewport in place, keeping the id
    fn retarget(&mut self, browser: Option<String>, viewport_name: Option<String>, now: DateTime<Utc>);

    /// Entries the reconciler drops regardless of files on disk
    fn is_disposable(&self) -> bool {
        false
    }

    /// Composite key of this entry
    fn composite_key(&self) -> CompositeKey {
        CompositeKey::with_target(
            self.subject_key(),
            self.browser().map(str::to_string),
            self.viewport_name().map(str::to_string),
        )
    }

    /// Recency used to pick a survivor among duplicates
    fn recency(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.updated_at(), self.created_at())
    }
}

/// Snapshot index entry: subject -> baseline image id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub subject_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_name: Option<String>,
    pub generated_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexEntry for SnapshotEntry {
    const INDEX_NAME: &'static str = "snapshots";
    const FILE_KINDS: &'static [FileKind] = &[FileKind::Baseline];

    fn create(key: &CompositeKey, generated_id: String, now: DateTime<Utc>) -> Self {
        Self {
            subject_key: key.subject_key.clone(),
            browser: key.browser.clone(),
            viewport_name: key.viewport_name.clone(),
            generated_id,
            created_at: now,
            updated_at: now,
        }
    }

    fn subject_key(&self) -> &str {
        &self.subject_key
    }

    fn browser(&self) -> Option<&str> {
        self.browser.as_deref()
    }

    fn viewport_name(&self) -> Option<&str> {
        self.viewport_name.as_deref()
    }

    fn generated_id(&self) -> &str {
        &self.generated_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn retarget(&mut self, browser: Option<String>, viewport_name: Option<String>, now: DateTime<Utc>) {
        self.browser = browser;
        self.viewport_name = viewport_name;
        self.updated_at = now;
    }
}

/// Measurements recorded alongside a verdict
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMetrics {
    pub browser: Option<String>,
    pub viewport_name: Option<String>,
    pub diff_pixels: Option<u64>,
    pub diff_percent: Option<f64>,
    /// Wall-clock time of the capture in milliseconds
    pub duration: Option<u64>,
    pub error: Option<String>,
}

/// Results index entry: the latest verdict for a subject
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub subject_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_name: Option<String>,
    pub generated_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_pixels: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResultEntry {
    /// Overwrite the verdict and measurements, keeping identity and `created_at`
    pub fn apply(&mut self, generated_id: &str, status: ResultStatus, metrics: ResultMetrics, now: DateTime<Utc>) {
        self.generated_id = generated_id.to_string();
        self.status = status;
        self.browser = metrics.browser;
        self.viewport_name = metrics.viewport_name;
        self.diff_pixels = metrics.diff_pixels;
        self.diff_percent = metrics.diff_percent;
        self.duration = metrics.duration;
        self.error = metrics.error;
        self.updated_at = now;
    }
}

impl IndexEntry for ResultEntry {
    const INDEX_NAME: &'static str = "results";
    const FILE_KINDS: &'static [FileKind] = &[FileKind::Actual, FileKind::Diff];

    fn create(key: &CompositeKey, generated_id: String, now: DateTime<Utc>) -> Self {
        Self {
            subject_key: key.subject_key.clone(),
            browser: key.browser.clone(),
            viewport_name: key.viewport_name.clone(),
            generated_id,
            // No verdict has been recorded yet
            status: ResultStatus::Missing,
            diff_pixels: None,
            diff_percent: None,
            duration: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn subject_key(&self) -> &str {
        &self.subject_key
    }

    fn browser(&self) -> Option<&str> {
        self.browser.as_deref()
    }

    fn viewport_name(&self) -> Option<&str> {
        self.viewport_name.as_deref()
    }

    fn generated_id(&self) -> &str {
        &self.generated_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn retarget(&mut self, browser: Option<String>, viewport_name: Option<String>, now: DateTime<Utc>) {
        self.browser = browser;
        self.viewport_name = viewport_name;
        self.updated_at = now;
    }

    /// Passing results intentionally keep no files
    fn is_disposable(&self) -> bool {
        self.status == ResultStatus::Passed
    }
}

/// The persisted index document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument<E> {
    pub version: u32,
    pub entries: Vec<E>,
}

impl<E> Default for IndexDocument<E> {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: Vec::new(),
        }
    }
}
