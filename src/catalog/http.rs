//! HTTP catalog client
//!
//! Reads the story index a Storybook build serves. Newer builds publish
//! `index.json` with an `entries` map; older ones publish `stories.json`
//! with a `stories` map.

use super::{CatalogError, CatalogSource, Subject};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const INDEX_FILES: [&str; 2] = ["index.json", "stories.json"];

/// Configuration for the HTTP catalog
#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    /// Base URL of the Storybook build (e.g., "http://localhost:6006")
    pub base_url: String,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for HttpCatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:6006".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Catalog served over HTTP
pub struct HttpCatalog {
    client: Client,
    config: HttpCatalogConfig,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    entries: Option<HashMap<String, CatalogItem>>,
    #[serde(default)]
    stories: Option<HashMap<String, CatalogItem>>,
}

#[derive(Debug, Deserialize)]
struct CatalogItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Turn a catalog document into subjects sorted by key
fn parse_document(document: CatalogDocument) -> Result<Vec<Subject>, CatalogError> {
    let items = document
        .entries
        .or(document.stories)
        .ok_or_else(|| CatalogError::Parse("neither `entries` nor `stories` present".to_string()))?;

    let mut subjects: Vec<Subject> = items
        .into_iter()
        .filter(|(_, item)| item.kind.as_deref().map_or(true, |k| k == "story"))
        .map(|(key, item)| Subject {
            key: item.id.unwrap_or(key),
            title: item.title,
            name: item.name,
        })
        .collect();

    subjects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(subjects)
}

impl HttpCatalog {
    pub fn new(config: HttpCatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    /// Get the current configuration
    pub fn config(&self) -> &HttpCatalogConfig {
        &self.config
    }

    fn url(&self, file: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), file)
    }

    /// Fetch one index file. `Ok(None)` means the server does not have it.
    async fn fetch(&self, file: &str) -> Result<Option<CatalogDocument>, CatalogError> {
        let url = self.url(file);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                CatalogError::Timeout
            } else if e.is_connect() {
                CatalogError::Unavailable { url: url.clone() }
            } else {
                CatalogError::Request(e)
            }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await?;
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| CatalogError::Parse(format!("{}: {}", url, e)))
            }
            status => Err(CatalogError::Http {
                status: status.as_u16(),
                url,
            }),
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn discover(&self) -> Result<Vec<Subject>, CatalogError> {
        for file in INDEX_FILES {
            if let Some(document) = self.fetch(file).await? {
                let subjects = parse_document(document)?;
                tracing::info!(source = %self.url(file), count = subjects.len(), "Discovered stories");
                return Ok(subjects);
            }
            tracing::debug!(file, "Catalog file not found, trying next");
        }

        Err(CatalogError::Http {
            status: 404,
            url: self.url(INDEX_FILES[0]),
        })
    }
}
