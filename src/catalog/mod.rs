//! Story Catalog
//!
//! Discovers the subjects a run covers and narrows them with filters.
//!
//! ## Architecture
//!
//! - **CatalogSource**: anything that can list subjects
//! - **HttpCatalog**: reads a Storybook-style `index.json` over HTTP
//! - **SubjectFilter**: include/exclude globs plus a regex grep

mod filter;
mod http;

pub use filter::SubjectFilter;
pub use http::{HttpCatalog, HttpCatalogConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One story in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Stable key, e.g. `forms-button--primary`
    pub key: String,
    /// Component title, e.g. `Forms/Button`
    pub title: String,
    /// Story name, e.g. `Primary`
    pub name: String,
}

impl Subject {
    pub fn new(key: impl Into<String>, title: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            name: name.into(),
        }
    }

    /// Human-readable label used in logs and notifications
    pub fn display_name(&self) -> String {
        if self.title.is_empty() {
            self.name.clone()
        } else {
            format!("{} / {}", self.title, self.name)
        }
    }
}

/// Source of subjects for a run
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// List every subject, sorted by key
    async fn discover(&self) -> Result<Vec<Subject>, CatalogError>;
}

/// Errors raised while discovering or filtering subjects
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog unavailable at {url}")]
    Unavailable { url: String },

    #[error("Catalog request timed out")]
    Timeout,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Catalog returned HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Invalid catalog: {0}")]
    Parse(String),

    #[error("Invalid filter pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
