//! Capture and Compare
//!
//! Boundary to the browser automation and pixel comparison that produce a
//! verdict for one subject. The engine only sees the [`Capturer`] trait; the
//! shipped [`CommandCapturer`] delegates to an external program.

mod command;

pub use command::CommandCapturer;

use crate::catalog::Subject;
use crate::index::ResultStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Where a capture reads and writes its images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTargets {
    pub baseline: PathBuf,
    pub actual: PathBuf,
    pub diff: PathBuf,
}

impl CaptureTargets {
    /// Create the parent directories of every target
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for path in [&self.baseline, &self.actual, &self.diff] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

/// Everything a capturer needs for one subject
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub subject: Subject,
    pub generated_id: String,
    pub targets: CaptureTargets,
    pub browser: Option<String>,
    pub viewport: Option<String>,
    /// Overwrite the baseline with the new capture instead of comparing
    pub update_baselines: bool,
}

/// Verdict reported by a capturer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutcome {
    pub status: ResultStatus,
    #[serde(default)]
    pub diff_pixels: Option<u64>,
    #[serde(default)]
    pub diff_percent: Option<f64>,
    /// Why the capture did not pass, when the capturer knows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureOutcome {
    fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            diff_pixels: None,
            diff_percent: None,
            error: None,
        }
    }

    pub fn passed() -> Self {
        Self::with_status(ResultStatus::Passed)
    }

    pub fn failed(diff_pixels: u64, diff_percent: f64) -> Self {
        Self {
            diff_pixels: Some(diff_pixels),
            diff_percent: Some(diff_percent),
            ..Self::with_status(ResultStatus::Failed)
        }
    }

    /// No baseline existed; the capture became the baseline
    pub fn new_baseline() -> Self {
        Self::with_status(ResultStatus::New)
    }

    /// No baseline existed and none was written
    pub fn missing() -> Self {
        Self::with_status(ResultStatus::Missing)
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Captures one subject and compares it with its baseline
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CaptureError>;
}

/// Errors raised by a capturer. The engine records them as failed results.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Invalid capture output: {0}")]
    InvalidOutput(String),

    #[error("Capture timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}
