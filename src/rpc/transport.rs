//! Line-delimited JSON-RPC transport
//!
//! Bidirectional: either side may send requests and notifications. A reader
//! task decodes inbound lines and a writer task serializes outbound ones, the
//! same split as a websocket connection's send/receive tasks.
//!
//! ```text
//! AsyncRead ─ lines ─▶ reader task ─┬─ response     → pending[id].send()
//!                                   ├─ request      → handler task → response
//!                                   └─ notification → listeners
//! request()/notify() ─▶ mpsc ─▶ writer task ─▶ AsyncWrite
//! ```

use super::messages::{Message, RpcError};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};

/// Method name that matches every notification
pub const ANY_METHOD: &str = "*";

/// Errors raised by the transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request '{method}' timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Transport terminated: {0}")]
    Terminated(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RpcError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker not ready (state: {0})")]
    NotReady(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Async method handler
pub type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Inbound notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

type Listener = Arc<dyn Fn(Notification) + Send + Sync>;

/// Identifies a registered listener for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

/// Configuration for a transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long `request` waits for a response
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<TransportResult<Value>>>;

struct Inner {
    config: TransportConfig,
    next_id: AtomicU64,
    next_listener: AtomicU64,
    pending: Mutex<PendingMap>,
    handlers: RwLock<HashMap<String, Handler>>,
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    outbound: mpsc::UnboundedSender<String>,
    terminated: AtomicBool,
    reason: Mutex<Option<String>>,
    closed: watch::Sender<bool>,
}

/// One end of a JSON-RPC connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Start reader and writer tasks over a stream pair
    pub fn new<R, W>(reader: R, writer: W, config: TransportConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(reader, writer, config, HashMap::new())
    }

    /// Like [`Transport::new`], with `callback` listening on `method` before
    /// the reader task starts, so the peer's first notification is not missed
    pub fn with_listener<R, W, F>(reader: R, writer: W, config: TransportConfig, method: &str, callback: F) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let entry = ListenerEntry {
            id: ListenerId(0),
            once: false,
            callback: Arc::new(callback),
        };
        Self::spawn(reader, writer, config, HashMap::from([(method.to_string(), vec![entry])]))
    }

    fn spawn<R, W>(reader: R, writer: W, config: TransportConfig, listeners: HashMap<String, Vec<ListenerEntry>>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let transport = Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                listeners: RwLock::new(listeners),
                outbound,
                terminated: AtomicBool::new(false),
                reason: Mutex::new(None),
                closed,
            }),
        };

        tokio::spawn(transport.clone().write_loop(writer, outbound_rx));
        tokio::spawn(transport.clone().read_loop(reader));
        transport
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Wait until the transport has terminated
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn terminated_error(&self) -> TransportError {
        let reason = self.inner.reason.lock().await.clone();
        TransportError::Terminated(reason.unwrap_or_else(|| "closed".to_string()))
    }

    fn send_message(&self, message: &Message) -> TransportResult<()> {
        let line = message.encode()?;
        self.inner
            .outbound
            .send(line)
            .map_err(|_| TransportError::Terminated("writer stopped".to_string()))
    }

    /// Register the handler for `method`, replacing any previous one
    pub async fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.inner.handlers.write().await.insert(method.into(), handler);
    }

    async fn add_listener(&self, method: String, once: bool, callback: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner
            .listeners
            .write()
            .await
            .entry(method)
            .or_default()
            .push(ListenerEntry { id, once, callback });
        id
    }

    /// Call `callback` for every notification named `method` (or every
    /// notification, for [`ANY_METHOD`])
    pub async fn on<F>(&self, method: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.add_listener(method.into(), false, Arc::new(callback)).await
    }

    /// Like [`Transport::on`], removed after the first call
    pub async fn once<F>(&self, method: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.add_listener(method.into(), true, Arc::new(callback)).await
    }

    pub async fn off(&self, id: ListenerId) {
        let mut listeners = self.inner.listeners.write().await;
        for entries in listeners.values_mut() {
            entries.retain(|e| e.id != id);
        }
        listeners.retain(|_, entries| !entries.is_empty());
    }

    /// Send a request and wait for its response with the configured timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        self.request_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> TransportResult<Value> {
        if self.is_terminated() {
            return Err(self.terminated_error().await);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        // Termination may have drained the map before the insert
        if self.is_terminated() {
            self.inner.pending.lock().await.remove(&id);
            return Err(self.terminated_error().await);
        }

        if let Err(e) = self.send_message(&Message::request(id, method, params)) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!(id, method, "Sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.terminated_error().await),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                tracing::warn!(id, method, "Request timed out");
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification. Fire and forget.
    pub fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        if self.is_terminated() {
            return Err(TransportError::Terminated("closed".to_string()));
        }
        self.send_message(&Message::notification(method, params))
    }

    /// Terminate: reject every pending request and stop both tasks
    pub async fn shutdown(&self, reason: &str) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.reason.lock().await = Some(reason.to_string());
        tracing::info!(reason, "Transport terminated");

        let pending: Vec<_> = self.inner.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Terminated(reason.to_string())));
        }

        self.inner.closed.send_replace(true);
    }

    async fn write_loop<W>(self, mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut closed = self.inner.closed.subscribe();

        loop {
            tokio::select! {
                biased;
                line = outbound.recv() => {
                    let Some(line) = line else { break };
                    let written = async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        tracing::debug!(error = %e, "Write failed");
                        self.shutdown(&format!("write failed: {}", e)).await;
                        break;
                    }
                }
                _ = until_closed(&mut closed) => break,
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn read_loop<R>(self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut closed = self.inner.closed.subscribe();

        let reason = loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = until_closed(&mut closed) => return,
            };

            match line {
                Ok(Some(line)) => self.dispatch(&line).await,
                Ok(None) => break "stream closed".to_string(),
                Err(e) => break format!("read failed: {}", e),
            }
        };

        self.shutdown(&reason).await;
    }

    async fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let message = match Message::decode(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed line");
                return;
            }
        };

        match message {
            Message::Response { id, result } => {
                let Some(id) = id.as_u64() else {
                    tracing::debug!(id = %id, "Response with foreign id ignored");
                    return;
                };
                match self.inner.pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(TransportError::Remote));
                    }
                    None => tracing::debug!(id, "Response for unknown request ignored"),
                }
            }
            Message::Request { id, method, params } => {
                let handler = self.inner.handlers.read().await.get(&method).cloned();
                let transport = self.clone();
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => match tokio::spawn(handler(params)).await {
                            Ok(result) => result,
                            Err(e) => {
                                tracing::error!(method = %method, error = %e, "Handler panicked");
                                Err(RpcError::internal(format!("Handler for '{}' panicked", method)))
                            }
                        },
                        None => Err(RpcError::method_not_found(&method)),
                    };
                    if let Err(e) = transport.send_message(&Message::response(id, result)) {
                        tracing::debug!(method = %method, error = %e, "Could not send response");
                    }
                });
            }
            Message::Notification { method, params } => {
                let callbacks: Vec<Listener> = {
                    let mut listeners = self.inner.listeners.write().await;
                    let mut callbacks = Vec::new();
                    for key in [method.as_str(), ANY_METHOD] {
                        if let Some(entries) = listeners.get_mut(key) {
                            callbacks.extend(entries.iter().map(|e| Arc::clone(&e.callback)));
                            entries.retain(|e| !e.once);
                        }
                    }
                    listeners.retain(|_, entries| !entries.is_empty());
                    callbacks
                };

                let notification = Notification { method, params };
                for callback in callbacks {
                    callback(notification.clone());
                }
            }
        }
    }
}

/// Resolves once the closed flag is set. Yields `()` so no watch guard is
/// held inside a `select!` across later awaits.
async fn until_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn pair(timeout: Duration) -> (Transport, Transport) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let config = TransportConfig { request_timeout: timeout };
        (
            Transport::new(a_read, a_write, config.clone()),
            Transport::new(b_read, b_write, config),
        )
    }

    /// Transport on one end, raw lines on the other
    fn raw_peer() -> (Transport, BufReader<tokio::io::ReadHalf<DuplexStream>>, tokio::io::WriteHalf<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Transport::new(a_read, a_write, TransportConfig::default()),
            BufReader::new(b_read),
            b_write,
        )
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client, server) = pair(Duration::from_secs(5));
        server
            .register("add", |params| async move {
                let params = params.unwrap_or_default();
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .await;

        let result = client.request("add", Some(json!({"a": 2, "b": 40}))).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transport_runs_inside_spawned_tasks() {
        let (client_end, server_end) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (read, write) = tokio::io::split(server_end);
            let server = Transport::new(read, write, TransportConfig::default());
            server.register("ping", |_| async move { Ok(json!("pong")) }).await;
            server.closed().await;
        });

        let client = tokio::spawn(async move {
            let (read, write) = tokio::io::split(client_end);
            let client = Transport::new(read, write, TransportConfig::default());
            // The handler may not be registered yet on the first attempt
            let mut reply = client.request("ping", None).await;
            for _ in 0..50 {
                if reply.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                reply = client.request("ping", None).await;
            }
            client.shutdown("done").await;
            reply
        });

        assert_eq!(client.await.unwrap().unwrap(), json!("pong"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_echoes_request_id() {
        let (transport, mut reader, mut writer) = raw_peer();
        transport.register("echo", |params| async move { Ok(params.unwrap_or_default()) }).await;

        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":42,\"method\":\"echo\",\"params\":{\"x\":1}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 42, "result": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (transport, mut reader, _writer) = raw_peer();

        let t = transport.clone();
        tokio::spawn(async move { t.request("first", None).await });
        let t = transport.clone();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        tokio::spawn(async move { t.request("second", None).await });
        let first: Value = serde_json::from_str(&line).unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let second: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(first["id"], json!(1));
        assert_eq!(first["method"], json!("first"));
        assert_eq!(second["id"], json!(2));
    }

    #[tokio::test]
    async fn test_timeout_does_not_cross_talk() {
        let (client, server) = pair(Duration::from_millis(100));
        server
            .register("slow", |_| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("slow"))
            })
            .await;
        server
            .register("medium", |_| async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(json!("medium"))
            })
            .await;

        let err = client.request("slow", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref method, timeout_ms: 100 } if method == "slow"));

        // The late "slow" response arrives while this one is pending
        let medium = client
            .request_with_timeout("medium", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(medium, json!("medium"));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_dropped() {
        let (transport, mut reader, mut writer) = raw_peer();
        transport.register("ping", |_| async move { Ok(json!("pong")) }).await;

        writer.write_all(b"garbage\n\n{\"jsonrpc\":\"2.0\"}\n").await.unwrap();
        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["result"], json!("pong"));
        assert!(!transport.is_terminated());
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let (client, _server) = pair(Duration::from_secs(5));

        match client.request("nope", None).await {
            Err(TransportError::Remote(e)) => assert_eq!(e.code, RpcError::METHOD_NOT_FOUND),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let (client, server) = pair(Duration::from_secs(5));
        server
            .register("fail", |_| async move { Err(RpcError::invalid_params("missing subject")) })
            .await;

        match client.request("fail", None).await {
            Err(TransportError::Remote(e)) => {
                assert_eq!(e.code, RpcError::INVALID_PARAMS);
                assert!(e.message.contains("missing subject"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let (client, server) = pair(Duration::from_secs(5));
        server
            .register("boom", |_| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            })
            .await;

        match client.request("boom", None).await {
            Err(TransportError::Remote(e)) => assert_eq!(e.code, RpcError::INTERNAL_ERROR),
            other => panic!("unexpected: {:?}", other),
        }

        // The transport survives
        server.register("ok", |_| async move { Ok(json!(true)) }).await;
        assert_eq!(client.request("ok", None).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_requests() {
        let (client, server) = pair(Duration::from_secs(30));
        server
            .register("hang", |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request("hang", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown("test over").await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Terminated(ref reason) if reason == "test over"));

        let err = client.request("hang", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Terminated(_)));
        assert!(client.notify("log", None).is_err());
    }

    #[tokio::test]
    async fn test_peer_eof_terminates() {
        let (transport, reader, writer) = raw_peer();
        drop(writer);
        drop(reader);

        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .unwrap();
        assert!(transport.is_terminated());
    }

    #[tokio::test]
    async fn test_notifications_reach_listeners() {
        let (client, server) = pair(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let progress_tx = tx.clone();
        client
            .on("progress", move |n| {
                let _ = progress_tx.send(format!("on:{}", n.params.unwrap_or_default()["completed"]));
            })
            .await;
        let once_tx = tx.clone();
        client
            .once("progress", move |_| {
                let _ = once_tx.send("once".to_string());
            })
            .await;
        let any_tx = tx;
        client
            .on(ANY_METHOD, move |n| {
                let _ = any_tx.send(format!("any:{}", n.method));
            })
            .await;

        server.notify("progress", Some(json!({"completed": 1}))).unwrap();
        server.notify("progress", Some(json!({"completed": 2}))).unwrap();
        server.notify("log", Some(json!({"message": "hi"}))).unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec!["on:1", "once", "any:progress", "on:2", "any:progress", "any:log"]
        );
    }

    #[tokio::test]
    async fn test_off_removes_listener() {
        let (client, server) = pair(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let removed_tx = tx.clone();
        let id = client
            .on("log", move |_| {
                let _ = removed_tx.send("removed");
            })
            .await;
        client
            .on("log", move |_| {
                let _ = tx.send("kept");
            })
            .await;
        client.off(id).await;

        server.notify("log", None).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "kept");
    }
}
