//! Configuration System
//!
//! Layered configuration with explicit precedence:
//!
//! ```text
//! defaults < config file (storyshot.toml) < STORYSHOT_* environment < CLI flags / RPC params
//! ```
//!
//! [`Config`] is always complete. Every layer above the defaults is a
//! [`PartialConfig`] whose set fields overwrite the ones below it.

use crate::capture::CommandCapturer;
use crate::catalog::{CatalogError, HttpCatalogConfig, SubjectFilter};
use crate::engine::RunOptions;
use crate::index::{IndexFormat, IndexStoreConfig};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Name of the project-local config file
pub const CONFIG_FILE_NAME: &str = "storyshot.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, for development
    #[default]
    Pretty,
    /// One JSON object per line, for CI
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the Storybook build
    pub storybook_url: String,
    /// Root of the baseline tree and snapshot index
    pub snapshot_dir: PathBuf,
    /// Root of the actual/diff tree and results index
    pub results_dir: PathBuf,
    pub concurrency: usize,
    /// Stop after this many failures (0 = run everything)
    pub max_failures: usize,
    pub browser: Option<String>,
    pub viewport: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub grep: Option<String>,
    pub update_baselines: bool,
    /// Program run once per subject to capture and compare
    pub capture_command: Option<String>,
    pub capture_args: Vec<String>,
    pub index_format: IndexFormat,
    pub snapshot_debounce_ms: u64,
    pub results_debounce_ms: u64,
    pub request_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storybook_url: "http://localhost:6006".to_string(),
            snapshot_dir: PathBuf::from(".storyshot/snapshots"),
            results_dir: PathBuf::from(".storyshot/results"),
            concurrency: 4,
            max_failures: 0,
            browser: None,
            viewport: None,
            include: Vec::new(),
            exclude: Vec::new(),
            grep: None,
            update_baselines: false,
            capture_command: None,
            capture_args: Vec::new(),
            index_format: IndexFormat::Json,
            snapshot_debounce_ms: 1000,
            results_debounce_ms: 250,
            request_timeout_ms: 30_000,
            discovery_timeout_ms: 30_000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// One configuration layer. Unset fields leave the layer below untouched.
///
/// The optional settings (`browser`, `viewport`, `grep`, `captureCommand`)
/// are doubly optional: an explicit `null` clears the value below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storybook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub browser: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub grep: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_baselines: Option<bool>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub capture_command: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_format: Option<IndexFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,
}

/// Present-but-null becomes `Some(None)`; absent stays `None` through `default`
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn parse_var<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value,
    })
}

fn parse_bool(var: &str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value,
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl PartialConfig {
    /// Load a layer from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Layer from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Layer from `STORYSHOT_*` variables supplied by `lookup`
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layer = PartialConfig::default();

        if let Some(v) = lookup("STORYSHOT_STORYBOOK_URL") {
            layer.storybook_url = Some(v);
        }
        if let Some(v) = lookup("STORYSHOT_SNAPSHOT_DIR") {
            layer.snapshot_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STORYSHOT_RESULTS_DIR") {
            layer.results_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("STORYSHOT_CONCURRENCY") {
            layer.concurrency = Some(parse_var("STORYSHOT_CONCURRENCY", v)?);
        }
        if let Some(v) = lookup("STORYSHOT_MAX_FAILURES") {
            layer.max_failures = Some(parse_var("STORYSHOT_MAX_FAILURES", v)?);
        }
        if let Some(v) = lookup("STORYSHOT_BROWSER") {
            layer.browser = Some(Some(v));
        }
        if let Some(v) = lookup("STORYSHOT_VIEWPORT") {
            layer.viewport = Some(Some(v));
        }
        if let Some(v) = lookup("STORYSHOT_INCLUDE") {
            layer.include = Some(split_list(&v));
        }
        if let Some(v) = lookup("STORYSHOT_EXCLUDE") {
            layer.exclude = Some(split_list(&v));
        }
        if let Some(v) = lookup("STORYSHOT_GREP") {
            layer.grep = Some(Some(v));
        }
        if let Some(v) = lookup("STORYSHOT_UPDATE_BASELINES") {
            layer.update_baselines = Some(parse_bool("STORYSHOT_UPDATE_BASELINES", v)?);
        }
        if let Some(v) = lookup("STORYSHOT_CAPTURE_COMMAND") {
            layer.capture_command = Some(Some(v));
        }
        if let Some(v) = lookup("STORYSHOT_INDEX_FORMAT") {
            layer.index_format = Some(parse_var("STORYSHOT_INDEX_FORMAT", v)?);
        }
        if let Some(v) = lookup("STORYSHOT_REQUEST_TIMEOUT_MS") {
            layer.request_timeout_ms = Some(parse_var("STORYSHOT_REQUEST_TIMEOUT_MS", v)?);
        }
        if let Some(v) = lookup("STORYSHOT_LOG_LEVEL") {
            layer.log_level = Some(v);
        }
        if let Some(v) = lookup("STORYSHOT_LOG_FORMAT") {
            layer.log_format = Some(parse_var("STORYSHOT_LOG_FORMAT", v)?);
        }

        Ok(layer)
    }

    /// Overlay `other` on top of this layer
    pub fn overlay(mut self, other: PartialConfig) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $( if other.$field.is_some() { self.$field = other.$field; } )*
            };
        }
        take!(
            storybook_url, snapshot_dir, results_dir, concurrency, max_failures, browser,
            viewport, include, exclude, grep, update_baselines, capture_command, capture_args,
            index_format, snapshot_debounce_ms, results_debounce_ms, request_timeout_ms,
            discovery_timeout_ms, log_level, log_format,
        );
        self
    }
}

impl Config {
    /// Apply every set field of `layer`
    pub fn merge(&mut self, layer: PartialConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $( if let Some(value) = layer.$field { self.$field = value; } )*
            };
        }
        set!(
            storybook_url, snapshot_dir, results_dir, concurrency, max_failures, browser, viewport,
            include, exclude, grep, update_baselines, capture_command, capture_args, index_format,
            snapshot_debounce_ms, results_debounce_ms, request_timeout_ms, discovery_timeout_ms,
            log_level, log_format,
        );
    }

    /// Copy of this config with `layer` applied
    pub fn merged(&self, layer: PartialConfig) -> Self {
        let mut config = self.clone();
        config.merge(layer);
        config
    }

    /// Load configuration from a file on top of the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.merge(PartialConfig::load(path)?);
        Ok(config)
    }

    /// First config file found in the default locations
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            Some(PathBuf::from(CONFIG_FILE_NAME)),
            dirs::config_dir().map(|p| p.join("storyshot").join("config.toml")),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }

    /// Build the full layered configuration and validate it.
    ///
    /// `file` overrides the default search; `overrides` is the top layer.
    pub fn load_layered(file: Option<&Path>, overrides: PartialConfig) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let file = file.map(Path::to_path_buf).or_else(Self::find_config_file);
        if let Some(path) = file {
            config.merge(PartialConfig::load(&path)?);
            tracing::debug!(path = ?path, "Loaded config file");
        }

        config.merge(PartialConfig::from_env()?);
        config.merge(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no run could succeed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.storybook_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "storybookUrl".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "requestTimeoutMs".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        self.subject_filter().map_err(|e| ConfigError::Invalid {
            field: "include/exclude/grep".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    pub fn subject_filter(&self) -> Result<SubjectFilter, CatalogError> {
        SubjectFilter::new(&self.include, &self.exclude, self.grep.as_deref())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            concurrency: self.concurrency,
            max_failures: self.max_failures,
            browser: self.browser.clone(),
            viewport: self.viewport.clone(),
            update_baselines: self.update_baselines,
        }
    }

    pub fn catalog_config(&self) -> HttpCatalogConfig {
        HttpCatalogConfig {
            base_url: self.storybook_url.clone(),
            request_timeout_ms: self.discovery_timeout_ms,
        }
    }

    pub fn snapshot_store_config(&self) -> IndexStoreConfig {
        IndexStoreConfig::snapshots()
            .debounce(Duration::from_millis(self.snapshot_debounce_ms))
            .format(self.index_format)
    }

    pub fn results_store_config(&self) -> IndexStoreConfig {
        IndexStoreConfig::results()
            .debounce(Duration::from_millis(self.results_debounce_ms))
            .format(self.index_format)
    }

    /// The configured capture program, if any
    pub fn capturer(&self) -> Option<CommandCapturer> {
        self.capture_command.as_ref().map(|program| {
            CommandCapturer::new(program.clone())
                .args(self.capture_args.iter().cloned())
                .env("STORYSHOT_STORYBOOK_URL", self.storybook_url.clone())
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {var}: '{value}'")]
    Env { var: String, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Storyshot Configuration
#
# Precedence: command-line flags > STORYSHOT_* environment > this file > defaults.
# Environment variables: STORYSHOT_STORYBOOK_URL, STORYSHOT_SNAPSHOT_DIR,
# STORYSHOT_RESULTS_DIR, STORYSHOT_CONCURRENCY, STORYSHOT_MAX_FAILURES,
# STORYSHOT_BROWSER, STORYSHOT_VIEWPORT, STORYSHOT_INCLUDE, STORYSHOT_EXCLUDE,
# STORYSHOT_GREP, STORYSHOT_UPDATE_BASELINES, STORYSHOT_CAPTURE_COMMAND,
# STORYSHOT_INDEX_FORMAT, STORYSHOT_REQUEST_TIMEOUT_MS, STORYSHOT_LOG_LEVEL,
# STORYSHOT_LOG_FORMAT

# Storybook build to test
storybookUrl = "http://localhost:6006"

# Baselines and the snapshot index
snapshotDir = ".storyshot/snapshots"

# Actual/diff images and the results index
resultsDir = ".storyshot/results"

# Stories captured at once
concurrency = 4

# Stop starting new stories after this many failures (0 = never)
maxFailures = 0

# Browser and viewport passed to the capture program
# browser = "chromium"
# viewport = "desktop"

# Glob filters (`*` wildcard) on story key, title or name; exclude wins
include = []
exclude = []

# Regular expression on story key or display name
# grep = "button"

# Overwrite baselines instead of comparing
updateBaselines = false

# Program run once per story; receives STORYSHOT_* variables and prints
# {"status":"passed|failed|new|missing","diffPixels":0,"diffPercent":0.0}
# captureCommand = "node"
captureArgs = []

# Index file layout: json or jsonl
indexFormat = "json"

# Index write debounce windows (ms)
snapshotDebounceMs = 1000
resultsDebounceMs = 250

# RPC request timeout and catalog discovery timeout (ms)
requestTimeoutMs = 30000
discoveryTimeoutMs = 30000

# Log level: trace, debug, info, warn, error
logLevel = "info"

# Log format: pretty (for development) or json (for CI)
logFormat = "pretty"
"#
    .to_string()
}
