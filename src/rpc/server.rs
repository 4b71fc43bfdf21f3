//! Worker Service
//!
//! Exposes runs over a [`Transport`]. Methods:
//!
//! | method      | result                                  |
//! |-------------|-----------------------------------------|
//! | `run`       | `{started: true}`; progress streams as notifications |
//! | `cancel`    | `{cancelled: bool}`                     |
//! | `setConfig` | merged config                           |
//! | `getConfig` | current config                          |
//! | `getStatus` | `{running, completed, total, state}`    |
//! | `getResults`| last run summary or `null`              |
//! | `cleanup`   | reconciler reports per index            |
//!
//! Notifications: `ready`, `progress`, `storyStart`, `storyComplete`, `log`,
//! `complete`, `error`.

use super::messages::RpcError;
use super::transport::{Transport, TransportResult};
use crate::capture::Capturer;
use crate::catalog::{CatalogError, CatalogSource, HttpCatalog};
use crate::config::{Config, ConfigError, PartialConfig};
use crate::engine::{CancelHandle, Engine, EngineEvent, ExitCode, RunSummary};
use crate::index::{CleanupOptions, CleanupReport, IndexResult, Reconciler, ResultsIndex, SnapshotIndex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Version announced in the `ready` notification
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the catalog and capturer a run uses from its effective config
pub trait Collaborators: Send + Sync {
    fn catalog(&self, config: &Config) -> Result<Arc<dyn CatalogSource>, CatalogError>;
    fn capturer(&self, config: &Config) -> Result<Arc<dyn Capturer>, ConfigError>;
}

/// HTTP catalog and external capture command, as configured
pub struct ConfiguredCollaborators;

impl Collaborators for ConfiguredCollaborators {
    fn catalog(&self, config: &Config) -> Result<Arc<dyn CatalogSource>, CatalogError> {
        Ok(Arc::new(HttpCatalog::new(config.catalog_config())?))
    }

    fn capturer(&self, config: &Config) -> Result<Arc<dyn Capturer>, ConfigError> {
        config
            .capturer()
            .map(|capturer| Arc::new(capturer) as Arc<dyn Capturer>)
            .ok_or_else(|| ConfigError::Invalid {
                field: "captureCommand".to_string(),
                reason: "not set".to_string(),
            })
    }
}

/// What the worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Idle,
    Discovering,
    Running,
    Cancelling,
    Cleaning,
}

/// Result of `getStatus`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub running: usize,
    pub completed: usize,
    pub total: usize,
    pub state: WorkerPhase,
}

/// Result of `cleanup`, one report per index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReports {
    pub snapshots: CleanupReport,
    pub results: CleanupReport,
}

#[derive(Debug)]
struct RunStatus {
    phase: WorkerPhase,
    running: usize,
    completed: usize,
    total: usize,
    cancel: Option<CancelHandle>,
}

impl RunStatus {
    fn idle() -> Self {
        Self {
            phase: WorkerPhase::Idle,
            running: 0,
            completed: 0,
            total: 0,
            cancel: None,
        }
    }
}

/// Stores opened for a given set of directories
struct OpenStores {
    snapshot_dir: PathBuf,
    results_dir: PathBuf,
    config: Config,
    snapshots: Arc<SnapshotIndex>,
    results: Arc<ResultsIndex>,
}

impl OpenStores {
    fn serves(&self, config: &Config) -> bool {
        self.snapshot_dir == config.snapshot_dir
            && self.results_dir == config.results_dir
            && self.config.index_format == config.index_format
            && self.config.snapshot_debounce_ms == config.snapshot_debounce_ms
            && self.config.results_debounce_ms == config.results_debounce_ms
    }

    async fn flush(&self) {
        if let Err(e) = self.snapshots.flush().await {
            tracing::warn!(error = %e, "Failed to flush snapshot index");
        }
        if let Err(e) = self.results.flush().await {
            tracing::warn!(error = %e, "Failed to flush results index");
        }
    }
}

/// A failed run: exit code plus the message sent as an `error` notification
type RunFailure = (ExitCode, String);

fn config_error(e: impl std::fmt::Display) -> RunFailure {
    (ExitCode::ConfigError, e.to_string())
}

fn runtime_error(e: impl std::fmt::Display) -> RunFailure {
    (ExitCode::RuntimeError, e.to_string())
}

struct WorkerState {
    transport: Transport,
    collaborators: Arc<dyn Collaborators>,
    config: RwLock<Config>,
    status: Mutex<RunStatus>,
    stores: Mutex<Option<OpenStores>>,
    last_summary: RwLock<Option<RunSummary>>,
}

fn parse_params<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(RpcError::invalid_params),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

impl WorkerState {
    fn notify(&self, method: &str, params: Value) {
        if let Err(e) = self.transport.notify(method, Some(params)) {
            tracing::debug!(method, error = %e, "Dropped notification");
        }
    }

    /// Stores for `config`, reopening them when directories or settings changed
    async fn stores(&self, config: &Config) -> IndexResult<(Arc<SnapshotIndex>, Arc<ResultsIndex>)> {
        let mut stores = self.stores.lock().await;

        if let Some(open) = stores.as_ref() {
            if open.serves(config) {
                return Ok((Arc::clone(&open.snapshots), Arc::clone(&open.results)));
            }
            open.flush().await;
        }

        let snapshots = Arc::new(
            SnapshotIndex::open(config.snapshot_dir.clone(), config.snapshot_store_config()).await?,
        );
        let results =
            Arc::new(ResultsIndex::open(config.results_dir.clone(), config.results_store_config()).await?);
        tracing::info!(snapshots = ?config.snapshot_dir, results = ?config.results_dir, "Opened indexes");

        *stores = Some(OpenStores {
            snapshot_dir: config.snapshot_dir.clone(),
            results_dir: config.results_dir.clone(),
            config: config.clone(),
            snapshots: Arc::clone(&snapshots),
            results: Arc::clone(&results),
        });
        Ok((snapshots, results))
    }

    async fn flush_stores(&self) {
        if let Some(open) = self.stores.lock().await.as_ref() {
            open.flush().await;
        }
    }

    async fn start_run(self: &Arc<Self>, params: Option<Value>) -> Result<Value, RpcError> {
        let overlay: PartialConfig = parse_params(params)?;

        let cancel = {
            let mut status = self.status.lock().await;
            if status.phase != WorkerPhase::Idle {
                return Err(RpcError::new(RpcError::RUN_ACTIVE, "A run is already in progress"));
            }
            let cancel = CancelHandle::new();
            *status = RunStatus {
                phase: WorkerPhase::Discovering,
                cancel: Some(cancel.clone()),
                ..RunStatus::idle()
            };
            cancel
        };

        let state = Arc::clone(self);
        tokio::spawn(async move { state.execute(overlay, cancel).await });

        Ok(json!({ "started": true }))
    }

    async fn execute(self: Arc<Self>, overlay: PartialConfig, cancel: CancelHandle) {
        let (code, cancelled) = match self.try_execute(overlay, &cancel).await {
            Ok(summary) => {
                let code = ExitCode::from_summary(&summary);
                let cancelled = summary.cancelled;
                *self.last_summary.write().await = Some(summary);
                (code, cancelled)
            }
            Err((code, message)) => {
                tracing::warn!(code = code.code(), error = %message, "Run failed");
                self.notify("error", json!({ "message": message }));
                (code, cancel.is_cancelled())
            }
        };

        *self.status.lock().await = RunStatus::idle();
        self.notify("complete", json!({ "code": code.code(), "cancelled": cancelled }));
    }

    async fn try_execute(self: &Arc<Self>, overlay: PartialConfig, cancel: &CancelHandle) -> Result<RunSummary, RunFailure> {
        let config = self.config.read().await.merged(overlay);

        config.validate().map_err(config_error)?;
        let filter = config.subject_filter().map_err(config_error)?;
        let capturer = self.collaborators.capturer(&config).map_err(config_error)?;
        let catalog = self.collaborators.catalog(&config).map_err(runtime_error)?;

        let subjects = filter.apply(catalog.discover().await.map_err(runtime_error)?);
        let (snapshots, results) = self.stores(&config).await.map_err(runtime_error)?;

        {
            let mut status = self.status.lock().await;
            if status.phase == WorkerPhase::Discovering {
                status.phase = WorkerPhase::Running;
            }
            status.total = subjects.len();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(snapshots, results, capturer)
            .with_events(events_tx)
            .with_cancel_handle(cancel.clone());
        let forward = tokio::spawn(Arc::clone(self).forward_events(events_rx));

        let summary = engine.run_all(subjects, config.run_options()).await;
        drop(engine);
        let _ = forward.await;

        summary.map_err(runtime_error)
    }

    /// Relay engine events as notifications and keep the status counters current
    async fn forward_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::SubjectStarted {
                    subject_key,
                    display_name,
                } => self.notify(
                    "storyStart",
                    json!({ "subjectKey": subject_key, "displayName": display_name }),
                ),
                EngineEvent::SubjectCompleted(result) => match serde_json::to_value(&result) {
                    Ok(result) => self.notify("storyComplete", json!({ "result": result })),
                    Err(e) => tracing::error!(error = %e, "Failed to serialize result"),
                },
                EngineEvent::Progress {
                    running,
                    completed,
                    total,
                } => {
                    {
                        let mut status = self.status.lock().await;
                        status.running = running;
                        status.completed = completed;
                        status.total = total;
                    }
                    self.notify(
                        "progress",
                        json!({ "running": running, "completed": completed, "total": total }),
                    );
                }
                EngineEvent::Log(message) => self.notify("log", json!({ "message": message })),
            }
        }
    }

    async fn cancel(&self) -> Result<Value, RpcError> {
        let mut status = self.status.lock().await;
        let active = matches!(status.phase, WorkerPhase::Discovering | WorkerPhase::Running);

        let cancelled = match (&status.cancel, active) {
            (Some(cancel), true) => {
                cancel.cancel();
                status.phase = WorkerPhase::Cancelling;
                tracing::info!("Run cancelled");
                true
            }
            _ => false,
        };

        Ok(json!({ "cancelled": cancelled }))
    }

    async fn set_config(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let overlay: PartialConfig = parse_params(params)?;

        let mut config = self.config.write().await;
        let merged = config.merged(overlay);
        merged.validate().map_err(RpcError::invalid_params)?;
        *config = merged;

        to_value(&*config)
    }

    async fn get_status(&self) -> Result<Value, RpcError> {
        let status = self.status.lock().await;
        to_value(&WorkerStatus {
            running: status.running,
            completed: status.completed,
            total: status.total,
            state: status.phase,
        })
    }

    async fn cleanup(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let options: CleanupOptions = parse_params(params)?;

        {
            let mut status = self.status.lock().await;
            if status.phase != WorkerPhase::Idle {
                return Err(RpcError::new(RpcError::RUN_ACTIVE, "Cannot clean up while a run is active"));
            }
            status.phase = WorkerPhase::Cleaning;
        }

        let result = self.run_cleanup(options.resolved()).await;
        self.status.lock().await.phase = WorkerPhase::Idle;
        result
    }

    async fn run_cleanup(&self, options: CleanupOptions) -> Result<Value, RpcError> {
        let config = self.config.read().await.clone();

        let valid_keys: Option<HashSet<String>> = if options.stale {
            let catalog = self
                .collaborators
                .catalog(&config)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            let subjects = catalog
                .discover()
                .await
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Some(subjects.into_iter().map(|s| s.key).collect())
        } else {
            None
        };

        let (snapshots, results) = self
            .stores(&config)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;

        let reports = CleanupReports {
            snapshots: Reconciler::new(snapshots).run(options, valid_keys.as_ref()).await,
            results: Reconciler::new(results).run(options, valid_keys.as_ref()).await,
        };
        self.flush_stores().await;
        tracing::info!(snapshots = %reports.snapshots, results = %reports.results, "Cleanup finished");

        to_value(&reports)
    }
}

/// Serves worker methods on one transport
pub struct WorkerService {
    state: Arc<WorkerState>,
}

impl WorkerService {
    pub fn new(transport: Transport, config: Config, collaborators: Arc<dyn Collaborators>) -> Self {
        Self {
            state: Arc::new(WorkerState {
                transport,
                collaborators,
                config: RwLock::new(config),
                status: Mutex::new(RunStatus::idle()),
                stores: Mutex::new(None),
                last_summary: RwLock::new(None),
            }),
        }
    }

    /// Register every method on the transport
    pub async fn register_methods(&self) {
        let transport = &self.state.transport;

        let state = Arc::clone(&self.state);
        transport
            .register("run", move |params| {
                let state = Arc::clone(&state);
                async move { state.start_run(params).await }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("cancel", move |_| {
                let state = Arc::clone(&state);
                async move { state.cancel().await }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("setConfig", move |params| {
                let state = Arc::clone(&state);
                async move { state.set_config(params).await }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("getConfig", move |_| {
                let state = Arc::clone(&state);
                async move { to_value(&*state.config.read().await) }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("getStatus", move |_| {
                let state = Arc::clone(&state);
                async move { state.get_status().await }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("getResults", move |_| {
                let state = Arc::clone(&state);
                async move { to_value(&*state.last_summary.read().await) }
            })
            .await;

        let state = Arc::clone(&self.state);
        transport
            .register("cleanup", move |params| {
                let state = Arc::clone(&state);
                async move { state.cleanup(params).await }
            })
            .await;
    }

    /// Register methods, announce `ready` and serve until the transport
    /// closes. Open indexes are flushed on the way out.
    pub async fn serve(self) -> TransportResult<()> {
        self.register_methods().await;

        let config = self.state.config.read().await.clone();
        if let Err(e) = self.state.stores(&config).await {
            tracing::warn!(error = %e, "Could not open indexes, will retry on first run");
        }

        self.state
            .transport
            .notify("ready", Some(json!({ "version": WORKER_VERSION })))?;
        tracing::info!(version = WORKER_VERSION, "Worker ready");

        self.state.transport.closed().await;

        if let Some(cancel) = self.state.status.lock().await.cancel.as_ref() {
            cancel.cancel();
        }
        self.state.flush_stores().await;
        tracing::info!("Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, CaptureOutcome, CaptureRequest};
    use crate::catalog::Subject;
    use crate::rpc::transport::{Notification, TransportConfig, TransportError, ANY_METHOD};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::duplex;

    struct StaticCatalog(Result<Vec<Subject>, String>);

    #[async_trait]
    impl CatalogSource for StaticCatalog {
        async fn discover(&self) -> Result<Vec<Subject>, CatalogError> {
            self.0.clone().map_err(CatalogError::Parse)
        }
    }

    /// Fails `a--two` with 120 pixels, passes everything else
    struct FixedCapturer {
        delay: Duration,
    }

    #[async_trait]
    impl Capturer for FixedCapturer {
        async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CaptureError> {
            tokio::time::sleep(self.delay).await;
            if request.subject.key == "a--two" {
                Ok(CaptureOutcome::failed(120, 0.5))
            } else {
                Ok(CaptureOutcome::passed())
            }
        }
    }

    struct TestCollaborators {
        subjects: Result<Vec<Subject>, String>,
        delay: Duration,
    }

    impl Collaborators for TestCollaborators {
        fn catalog(&self, _config: &Config) -> Result<Arc<dyn CatalogSource>, CatalogError> {
            Ok(Arc::new(StaticCatalog(self.subjects.clone())))
        }

        fn capturer(&self, _config: &Config) -> Result<Arc<dyn Capturer>, ConfigError> {
            Ok(Arc::new(FixedCapturer { delay: self.delay }))
        }
    }

    struct Harness {
        client: Transport,
        notifications: mpsc::UnboundedReceiver<Notification>,
        _dir: TempDir,
    }

    impl Harness {
        /// Next notification named `method`, skipping others
        async fn next(&mut self, method: &str) -> Notification {
            loop {
                let notification = tokio::time::timeout(Duration::from_secs(5), self.notifications.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if notification.method == method {
                    return notification;
                }
            }
        }
    }

    async fn start(subjects: Result<Vec<Subject>, String>, delay: Duration) -> Harness {
        let dir = tempdir().unwrap();
        let config = Config {
            snapshot_dir: dir.path().join("snapshots"),
            results_dir: dir.path().join("results"),
            snapshot_debounce_ms: 20,
            results_debounce_ms: 20,
            ..Default::default()
        };

        let (client_end, server_end) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let client = Transport::new(client_read, client_write, TransportConfig::default());
        let (tx, notifications) = mpsc::unbounded_channel();
        client
            .on(ANY_METHOD, move |n| {
                let _ = tx.send(n);
            })
            .await;

        let server = Transport::new(server_read, server_write, TransportConfig::default());
        let collaborators = Arc::new(TestCollaborators { subjects, delay });
        tokio::spawn(WorkerService::new(server, config, collaborators).serve());

        let mut harness = Harness {
            client,
            notifications,
            _dir: dir,
        };
        harness.next("ready").await;
        harness
    }

    fn two_subjects() -> Result<Vec<Subject>, String> {
        Ok(vec![
            Subject::new("a--one", "A", "One"),
            Subject::new("a--two", "A", "Two"),
        ])
    }

    #[tokio::test]
    async fn test_ready_announces_version() {
        let dir = tempdir().unwrap();
        let (client_end, server_end) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);
        let client = Transport::new(client_read, client_write, TransportConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .once("ready", move |n| {
                let _ = tx.send(n);
            })
            .await;

        let config = Config {
            snapshot_dir: dir.path().join("s"),
            results_dir: dir.path().join("r"),
            ..Default::default()
        };
        let server = Transport::new(server_read, server_write, TransportConfig::default());
        tokio::spawn(WorkerService::new(server, config, Arc::new(ConfiguredCollaborators)).serve());

        let ready = rx.recv().await.unwrap();
        assert_eq!(ready.params.unwrap()["version"], json!(WORKER_VERSION));
    }

    #[tokio::test]
    async fn test_run_reports_progress_and_results() {
        let mut h = start(two_subjects(), Duration::from_millis(5)).await;

        let started = h.client.request("run", None).await.unwrap();
        assert_eq!(started, json!({ "started": true }));

        let first = h.next("storyStart").await;
        assert!(first.params.unwrap()["subjectKey"].as_str().unwrap().starts_with("a--"));

        let complete = h.next("complete").await.params.unwrap();
        assert_eq!(complete["code"], json!(1));
        assert_eq!(complete["cancelled"], json!(false));

        let results = h.client.request("getResults", None).await.unwrap();
        assert_eq!(results["total"], json!(2));
        assert_eq!(results["passed"], json!(1));
        assert_eq!(results["failed"], json!(1));
        assert_eq!(results["results"][1]["diffPixels"], json!(120));

        let status = h.client.request("getStatus", None).await.unwrap();
        assert_eq!(status["state"], json!("idle"));
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_active() {
        let mut h = start(two_subjects(), Duration::from_millis(200)).await;

        h.client.request("run", None).await.unwrap();
        match h.client.request("run", None).await {
            Err(TransportError::Remote(e)) => assert_eq!(e.code, RpcError::RUN_ACTIVE),
            other => panic!("unexpected: {:?}", other),
        }

        h.next("complete").await;
    }

    #[tokio::test]
    async fn test_cancel() {
        let subjects = Ok((0..20).map(|i| Subject::new(format!("a--s{:02}", i), "A", "S")).collect());
        let mut h = start(subjects, Duration::from_millis(50)).await;

        h.client.request("run", Some(json!({ "concurrency": 1 }))).await.unwrap();
        h.next("storyStart").await;

        let cancelled = h.client.request("cancel", None).await.unwrap();
        assert_eq!(cancelled, json!({ "cancelled": true }));

        let complete = h.next("complete").await.params.unwrap();
        assert_eq!(complete["cancelled"], json!(true));
        assert_eq!(complete["code"], json!(0));

        let again = h.client.request("cancel", None).await.unwrap();
        assert_eq!(again, json!({ "cancelled": false }));
    }

    #[tokio::test]
    async fn test_discovery_failure_reports_error() {
        let mut h = start(Err("storybook down".to_string()), Duration::ZERO).await;

        h.client.request("run", None).await.unwrap();
        let error = h.next("error").await.params.unwrap();
        assert!(error["message"].as_str().unwrap().contains("storybook down"));

        let complete = h.next("complete").await.params.unwrap();
        assert_eq!(complete["code"], json!(3));
    }

    #[tokio::test]
    async fn test_invalid_run_params_report_config_error() {
        let mut h = start(two_subjects(), Duration::ZERO).await;

        h.client.request("run", Some(json!({ "concurrency": 0 }))).await.unwrap();
        let complete = h.next("complete").await.params.unwrap();
        assert_eq!(complete["code"], json!(2));
    }

    #[tokio::test]
    async fn test_set_and_get_config() {
        let h = start(two_subjects(), Duration::ZERO).await;

        let merged = h
            .client
            .request("setConfig", Some(json!({ "maxFailures": 3, "browser": "webkit" })))
            .await
            .unwrap();
        assert_eq!(merged["maxFailures"], json!(3));
        assert_eq!(merged["browser"], json!("webkit"));

        let config = h.client.request("getConfig", None).await.unwrap();
        assert_eq!(config, merged);

        let cleared = h
            .client
            .request("setConfig", Some(json!({ "browser": null })))
            .await
            .unwrap();
        assert_eq!(cleared["browser"], Value::Null);
        assert_eq!(cleared["maxFailures"], json!(3));

        match h.client.request("setConfig", Some(json!({ "concurrency": 0 }))).await {
            Err(TransportError::Remote(e)) => assert_eq!(e.code, RpcError::INVALID_PARAMS),
            other => panic!("unexpected: {:?}", other),
        }
        match h.client.request("setConfig", Some(json!({ "concurrency": "lots" }))).await {
            Err(TransportError::Remote(e)) => assert_eq!(e.code, RpcError::INVALID_PARAMS),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_results_before_any_run() {
        let h = start(two_subjects(), Duration::ZERO).await;
        assert_eq!(h.client.request("getResults", None).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_cleanup_after_run() {
        let mut h = start(two_subjects(), Duration::ZERO).await;

        h.client.request("run", None).await.unwrap();
        h.next("complete").await;

        // The fixed capturer writes no files, so every entry is orphaned
        let report = h.client.request("cleanup", Some(json!({ "orphans": true }))).await.unwrap();
        assert_eq!(report["snapshots"]["entriesRemoved"], json!(2));
        assert_eq!(report["results"]["entriesRemoved"], json!(1));
    }
}
