//! # Storyshot
//!
//! Visual regression runner: captures every story a component catalog
//! exposes, compares each capture to a stored baseline and records the
//! verdict.
//!
//! ## Modules
//!
//! - [`index`]: persistent snapshot and results indexes, plus the reconciler
//! - [`catalog`]: subject discovery and include/exclude/grep filtering
//! - [`capture`]: the capture-and-compare collaborator
//! - [`engine`]: bounded-concurrency runs with a failure limit
//! - [`rpc`]: line-delimited JSON-RPC transport, worker service and client
//! - [`config`]: layered configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storyshot::catalog::{CatalogSource, HttpCatalog};
//! use storyshot::config::Config;
//! use storyshot::engine::Engine;
//! use storyshot::index::{ResultsIndex, SnapshotIndex};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_layered(None, Default::default())?;
//!
//!     let subjects = HttpCatalog::new(config.catalog_config())?.discover().await?;
//!     let subjects = config.subject_filter()?.apply(subjects);
//!
//!     let snapshots = SnapshotIndex::open(config.snapshot_dir.clone(), config.snapshot_store_config()).await?;
//!     let results = ResultsIndex::open(config.results_dir.clone(), config.results_store_config()).await?;
//!     let capturer = config.capturer().ok_or_else(|| anyhow::anyhow!("captureCommand is not set"))?;
//!
//!     let engine = Engine::new(Arc::new(snapshots), Arc::new(results), Arc::new(capturer));
//!     let summary = engine.run_all(subjects, config.run_options()).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod index;
pub mod logging;
pub mod rpc;

pub use capture::{CaptureError, CaptureOutcome, CaptureRequest, Capturer, CommandCapturer};
pub use catalog::{CatalogError, CatalogSource, HttpCatalog, Subject, SubjectFilter};
pub use config::{Config, ConfigError, PartialConfig};
pub use engine::{CancelHandle, Engine, EngineError, ExitCode, RunOptions, RunSummary, SubjectResult};
pub use index::{
    CleanupOptions, CleanupReport, IndexError, IndexStore, Reconciler, ResultStatus, ResultsIndex, SnapshotIndex,
};
pub use rpc::{RpcClient, RpcError, Transport, TransportError, WorkerService};
