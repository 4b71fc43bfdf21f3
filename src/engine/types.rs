//! Engine options, results and events

use crate::index::ResultStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Options for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Upper bound on subjects captured at once
    pub concurrency: usize,
    /// Stop starting new subjects after this many failures (0 = never)
    pub max_failures: usize,
    pub browser: Option<String>,
    pub viewport: Option<String>,
    pub update_baselines: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_failures: 0,
            browser: None,
            viewport: None,
            update_baselines: false,
        }
    }
}

impl RunOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    pub fn viewport(mut self, viewport: impl Into<String>) -> Self {
        self.viewport = Some(viewport.into());
        self
    }

    pub fn update_baselines(mut self, update: bool) -> Self {
        self.update_baselines = update;
        self
    }
}

/// Outcome of one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_key: String,
    pub display_name: String,
    pub generated_id: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_pixels: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_percent: Option<f64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub actual_path: PathBuf,
    pub diff_path: PathBuf,
}

/// Aggregate of a finished run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Subjects handed to the run, including any never started
    pub total: usize,
    pub passed: usize,
    /// Failed or missing
    pub failed: usize,
    pub new_baselines: usize,
    /// Stopped by a cancel request
    pub cancelled: bool,
    /// Stopped by the failure limit
    pub stopped_early: bool,
    /// Sorted by subject key
    pub results: Vec<SubjectResult>,
}

impl RunSummary {
    /// Subjects that were never started
    pub fn skipped(&self) -> usize {
        self.total.saturating_sub(self.results.len())
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} total, {} passed, {} failed, {} new",
            self.total, self.passed, self.failed, self.new_baselines
        )?;
        if self.skipped() > 0 {
            write!(f, ", {} skipped", self.skipped())?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Progress reported while a run is active
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SubjectStarted {
        subject_key: String,
        display_name: String,
    },
    SubjectCompleted(SubjectResult),
    Progress {
        running: usize,
        completed: usize,
        total: usize,
    },
    Log(String),
}

/// Cooperative stop switch for a run.
///
/// Workers check it before taking the next subject; captures already in
/// flight finish and are recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Errors that prevent a run from producing a summary
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A run is already in progress")]
    AlreadyRunning,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Process exit status of a run, also reported in the worker's `complete`
/// notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ExitCode {
    Success,
    TestsFailed,
    ConfigError,
    RuntimeError,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TestsFailed => 1,
            ExitCode::ConfigError => 2,
            ExitCode::RuntimeError => 3,
        }
    }

    /// Cancellation is not a failure; only failed or missing subjects are
    pub fn from_summary(summary: &RunSummary) -> Self {
        if summary.has_failures() {
            ExitCode::TestsFailed
        } else {
            ExitCode::Success
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

impl TryFrom<i32> for ExitCode {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ExitCode::Success),
            1 => Ok(ExitCode::TestsFailed),
            2 => Ok(ExitCode::ConfigError),
            3 => Ok(ExitCode::RuntimeError),
            other => Err(format!("unknown exit code: {}", other)),
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code() as u8)
    }
}
