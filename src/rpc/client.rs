//! Client side of the worker protocol
//!
//! Spawns (or attaches to) a worker, waits for its `ready` notification and
//! wraps each worker method in a typed call.

use super::server::{CleanupReports, WorkerStatus};
use super::transport::{ListenerId, Notification, Transport, TransportConfig, TransportError, TransportResult, ANY_METHOD};
use crate::config::{Config, PartialConfig};
use crate::engine::RunSummary;
use crate::index::CleanupOptions;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// Lifecycle of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Starting,
    WaitingForReady,
    Ready,
    Terminated,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Idle => "idle",
            ClientState::Starting => "starting",
            ClientState::WaitingForReady => "waiting for ready",
            ClientState::Ready => "ready",
            ClientState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How to launch a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the worker's `ready` notification
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection to one worker
pub struct RpcClient {
    config: ClientConfig,
    state: watch::Sender<ClientState>,
    transport: Option<Transport>,
    child: Option<Child>,
    worker_version: watch::Sender<Option<String>>,
    /// Bumped per connection; tasks of an older connection leave the state alone
    generation: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        let (worker_version, _) = watch::channel(None);
        Self {
            config,
            state,
            transport: None,
            child: None,
            worker_version,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Version the worker announced, once ready
    pub fn worker_version(&self) -> Option<String> {
        self.worker_version.borrow().clone()
    }

    fn ensure_startable(&self) -> TransportResult<()> {
        match self.state() {
            ClientState::Idle | ClientState::Terminated => Ok(()),
            other => Err(TransportError::NotReady(format!("cannot start while {}", other))),
        }
    }

    /// Spawn a worker and wait until it is ready.
    ///
    /// The worker speaks on stdin/stdout; its stderr is inherited so its logs
    /// land next to ours.
    pub async fn start(&mut self, command: &WorkerCommand) -> TransportResult<()> {
        self.ensure_startable()?;
        self.state.send_replace(ClientState::Starting);
        tracing::info!(program = %command.program, "Starting worker");

        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.state.send_replace(ClientState::Terminated);
                return Err(TransportError::Io(e));
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.state.send_replace(ClientState::Terminated);
            return Err(TransportError::Terminated("worker stdio unavailable".to_string()));
        };

        self.child = Some(child);
        self.connect(stdout, stdin).await
    }

    /// Speak to a worker over an existing stream pair
    pub async fn attach<R, W>(&mut self, reader: R, writer: W) -> TransportResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.ensure_startable()?;
        self.connect(reader, writer).await
    }

    async fn connect<R, W>(&mut self, reader: R, writer: W) -> TransportResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ClientState::WaitingForReady);

        let state = self.state.clone();
        let version = self.worker_version.clone();
        let transport_config = TransportConfig {
            request_timeout: self.config.request_timeout,
        };
        let transport = Transport::with_listener(reader, writer, transport_config, "ready", move |n: Notification| {
            let announced = n
                .params
                .as_ref()
                .and_then(|p| p.get("version"))
                .and_then(Value::as_str)
                .map(str::to_string);
            version.send_replace(announced);
            state.send_if_modified(|s| {
                if *s == ClientState::WaitingForReady {
                    *s = ClientState::Ready;
                    true
                } else {
                    false
                }
            });
        });

        let state = self.state.clone();
        let current = Arc::clone(&self.generation);
        let watched = transport.clone();
        tokio::spawn(async move {
            watched.closed().await;
            state.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) != generation || *s == ClientState::Terminated {
                    return false;
                }
                *s = ClientState::Terminated;
                true
            });
        });

        self.transport = Some(transport.clone());

        let mut states = self.state.subscribe();
        let ready = match tokio::time::timeout(
            self.config.ready_timeout,
            states.wait_for(|s| matches!(s, ClientState::Ready | ClientState::Terminated)),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state == ClientState::Ready),
            Ok(Err(_)) => Some(false),
            Err(_) => None,
        };

        match ready {
            Some(true) => {
                tracing::info!(version = ?self.worker_version(), "Worker ready");
                Ok(())
            }
            Some(false) => {
                self.state.send_replace(ClientState::Terminated);
                Err(TransportError::Terminated("worker exited before ready".to_string()))
            }
            None => {
                transport.shutdown("ready timeout").await;
                self.state.send_replace(ClientState::Terminated);
                Err(TransportError::Timeout {
                    method: "ready".to_string(),
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn transport(&self) -> TransportResult<&Transport> {
        match (&self.transport, self.state()) {
            (Some(transport), ClientState::Ready) => Ok(transport),
            (_, state) => Err(TransportError::NotReady(state.to_string())),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> TransportResult<T> {
        let value = self.transport()?.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Start a run with `overrides` layered over the worker's config.
    /// Returns once the worker accepted; the outcome arrives as `complete`.
    pub async fn run(&self, overrides: &PartialConfig) -> TransportResult<()> {
        self.transport()?
            .request("run", Some(serde_json::to_value(overrides)?))
            .await?;
        Ok(())
    }

    /// Ask the worker to stop taking new subjects. False when nothing ran.
    pub async fn cancel(&self) -> TransportResult<bool> {
        let value = self.transport()?.request("cancel", None).await?;
        Ok(value.get("cancelled").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn set_config(&self, overrides: &PartialConfig) -> TransportResult<Config> {
        self.call("setConfig", Some(serde_json::to_value(overrides)?)).await
    }

    pub async fn get_config(&self) -> TransportResult<Config> {
        self.call("getConfig", None).await
    }

    pub async fn get_status(&self) -> TransportResult<WorkerStatus> {
        self.call("getStatus", None).await
    }

    /// Summary of the last finished run, if any
    pub async fn get_results(&self) -> TransportResult<Option<RunSummary>> {
        self.call("getResults", None).await
    }

    pub async fn cleanup(&self, options: CleanupOptions) -> TransportResult<CleanupReports> {
        self.call("cleanup", Some(serde_json::to_value(options)?)).await
    }

    /// Listen for worker notifications (`*` for all of them)
    pub async fn on_notification<F>(&self, method: &str, callback: F) -> TransportResult<ListenerId>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        match &self.transport {
            Some(transport) if !transport.is_terminated() => Ok(transport.on(method, callback).await),
            _ => Err(TransportError::NotReady(self.state().to_string())),
        }
    }

    /// Every notification as a stream
    pub async fn notifications(&self) -> TransportResult<mpsc::UnboundedReceiver<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_notification(ANY_METHOD, move |n| {
            let _ = tx.send(n);
        })
        .await?;
        Ok(rx)
    }

    /// Wait until the worker connection ends
    pub async fn closed(&self) {
        if let Some(transport) = &self.transport {
            transport.closed().await;
        }
    }

    /// Close the connection and reap the worker process
    pub async fn shutdown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown("client shutdown").await;
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Worker exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
                Err(_) => {
                    tracing::warn!("Worker did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill worker");
                    }
                }
            }
        }

        self.state.send_replace(ClientState::Terminated);
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
