//! Subprocess worker manager.
//!
//! Triks without an in-process graph execute inside an external runtime
//! worker (the Node.js reference worker by default). The manager owns the
//! child process and speaks newline-delimited JSON-RPC over its stdio:
//! outbound `health`/`invoke`/`shutdown` requests, and inbound `storage.*`
//! requests proxied against the storage context bound for the current
//! invoke. Multiple requests may be in flight; responses are routed by id
//! through a pending-request table, and every stdin write goes through a
//! single async lock so frames never interleave.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::instrument;
use trikgate_protocol::{
    parse_message, serialize_message, HealthResult, InvokeParams, InvokeResult, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, STORAGE_ERROR,
};
use trikgate_store::StorageContext;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker startup timed out after {0}ms")]
    StartupTimeout(u64),

    #[error("worker startup failed: {0}")]
    StartupFailed(String),

    #[error("invoke timed out after {0}ms")]
    InvokeTimeout(u64),

    /// The worker process died or was killed with requests in flight
    #[error("worker killed")]
    Killed,

    #[error("worker not started")]
    NotStarted,

    #[error("worker script not found; install @trikhub/worker-js")]
    ScriptNotFound,

    #[error("protocol error: {0}")]
    Protocol(#[from] trikgate_protocol::ProtocolError),

    /// The worker answered with a JSON-RPC error
    #[error("worker error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the subprocess worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Runtime executable used to run a worker script
    pub runtime_path: String,
    /// Explicit worker script path; probed when unset
    pub worker_script: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub invoke_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            runtime_path: "node".to_string(),
            worker_script: None,
            startup_timeout_ms: 10_000,
            invoke_timeout_ms: 60_000,
        }
    }
}

/// How to launch the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLaunch {
    /// Run a script with the configured runtime
    Script(PathBuf),
    /// Run a package through `npx` when no script is installed
    PackageRunner(String),
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Probe the fixed locations for the worker, in order: explicit config,
/// local build output, PATH binary, local node_modules, npx fallback.
pub fn find_worker_launch(config: &WorkerConfig) -> Result<WorkerLaunch> {
    if let Some(script) = &config.worker_script {
        return Ok(WorkerLaunch::Script(script.clone()));
    }

    let local_build = Path::new("packages/js/worker/dist/worker.js");
    if local_build.is_file() {
        return Ok(WorkerLaunch::Script(local_build.to_path_buf()));
    }

    if let Some(binary) = find_in_path("trikhub-worker-js") {
        return Ok(WorkerLaunch::Script(binary));
    }

    let node_modules = Path::new("node_modules/@trikhub/worker-js/dist/worker.js");
    if node_modules.is_file() {
        return Ok(WorkerLaunch::Script(node_modules.to_path_buf()));
    }

    if find_in_path("npx").is_some() {
        return Ok(WorkerLaunch::PackageRunner("@trikhub/worker-js".to_string()));
    }

    Err(WorkerError::ScriptNotFound)
}

type SharedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the manager and its reader task.
struct WorkerShared {
    pending: Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    storage: tokio::sync::Mutex<Option<Arc<dyn StorageContext>>>,
    writer: tokio::sync::Mutex<Option<SharedWriter>>,
    ready: AtomicBool,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            storage: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(WorkerError::NotStarted)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let line = serialize_message(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request.id.clone(), tx);

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().expect("pending lock poisoned").remove(&request.id);
            return Err(e);
        }

        rx.await.map_err(|_| WorkerError::Killed)
    }

    fn take_pending(&self, id: &str) {
        self.pending.lock().expect("pending lock poisoned").remove(id);
    }

    /// Drop every in-flight request; receivers observe `Killed`.
    fn fail_pending(&self) {
        self.pending.lock().expect("pending lock poisoned").clear();
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        let response = if request.method.starts_with("storage.") {
            self.handle_storage_request(&request).await
        } else {
            JsonRpcResponse::failure(
                request.id.clone(),
                METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
            )
        };

        match serialize_message(&response) {
            Ok(line) => {
                if let Err(e) = self.write_line(&line).await {
                    tracing::warn!("failed to answer worker request: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to encode worker response: {e}"),
        }
    }

    async fn handle_storage_request(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let storage = self.storage.lock().await.clone();
        let Some(storage) = storage else {
            return JsonRpcResponse::failure(
                request.id.clone(),
                STORAGE_ERROR,
                "Storage not available",
            );
        };

        let params = request.params.clone().unwrap_or_else(|| json!({}));
        match serve_storage(storage.as_ref(), &request.method, &params).await {
            Ok(result) => JsonRpcResponse::success(request.id.clone(), result),
            Err((code, message)) => JsonRpcResponse::failure(request.id.clone(), code, message),
        }
    }
}

fn storage_failure(e: trikgate_store::Error) -> (i64, String) {
    (STORAGE_ERROR, format!("Storage error: {e}"))
}

async fn serve_storage(
    storage: &dyn StorageContext,
    method: &str,
    params: &Value,
) -> std::result::Result<Value, (i64, String)> {
    let key = params.get("key").and_then(Value::as_str).unwrap_or("");

    match method {
        "storage.get" => {
            let value = storage.get(key).await.map_err(storage_failure)?;
            Ok(json!({ "value": value }))
        }
        "storage.set" => {
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            let ttl = params.get("ttl").and_then(Value::as_u64);
            storage.set(key, value, ttl).await.map_err(storage_failure)?;
            Ok(json!({ "success": true }))
        }
        "storage.delete" => {
            let deleted = storage.delete(key).await.map_err(storage_failure)?;
            Ok(json!({ "deleted": deleted }))
        }
        "storage.list" => {
            let prefix = params.get("prefix").and_then(Value::as_str);
            let keys = storage.list(prefix).await.map_err(storage_failure)?;
            Ok(json!({ "keys": keys }))
        }
        "storage.getMany" => {
            let keys: Vec<String> = params
                .get("keys")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| (STORAGE_ERROR, format!("Storage error: {e}")))?
                .unwrap_or_default();
            let values = storage.get_many(&keys).await.map_err(storage_failure)?;
            Ok(json!({ "values": values }))
        }
        "storage.setMany" => {
            let entries: BTreeMap<String, Value> = params
                .get("entries")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| (STORAGE_ERROR, format!("Storage error: {e}")))?
                .unwrap_or_default();
            storage.set_many(entries).await.map_err(storage_failure)?;
            Ok(json!({ "success": true }))
        }
        _ => Err((METHOD_NOT_FOUND, format!("Unknown storage method: {method}"))),
    }
}

/// Parse frames off the worker's stdout and route them.
async fn read_frames<R>(reader: R, shared: Arc<WorkerShared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_message(line) {
                    Ok(JsonRpcMessage::Response(response)) => {
                        let sender = shared
                            .pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&response.id);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(response);
                            }
                            None => tracing::debug!(id = %response.id, "response for unknown request"),
                        }
                    }
                    Ok(JsonRpcMessage::Request(request)) => shared.handle_request(request).await,
                    Err(e) => tracing::warn!("unparseable worker frame: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("worker stdout read error: {e}");
                break;
            }
        }
    }
    shared.ready.store(false, Ordering::SeqCst);
    shared.fail_pending();
}

async fn log_stderr<R>(reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(target: "trikgate::worker", "{line}");
        }
    }
}

/// Manager for one worker process.
pub struct WorkerManager {
    config: WorkerConfig,
    shared: Arc<WorkerShared>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(WorkerShared::new()),
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Start the worker and wait for its health handshake.
    ///
    /// Idempotent; concurrent callers serialize on the startup lock and the
    /// late ones observe the already-ready worker.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let launch = find_worker_launch(&self.config)?;
        let mut command = match &launch {
            WorkerLaunch::Script(script) => {
                let mut command = Command::new(&self.config.runtime_path);
                command.arg(script);
                command
            }
            WorkerLaunch::PackageRunner(package) => {
                let mut command = Command::new("npx");
                command.arg(package);
                command
            }
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("NODE_NO_WARNINGS", "1")
            .kill_on_drop(true);

        tracing::info!(?launch, "starting worker");
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or(WorkerError::NotStarted)?;
        let stdout = child.stdout.take().ok_or(WorkerError::NotStarted)?;
        let stderr = child.stderr.take().ok_or(WorkerError::NotStarted)?;

        *self.shared.writer.lock().await = Some(Box::new(stdin));
        let reader = tokio::spawn(read_frames(stdout, Arc::clone(&self.shared)));
        let stderr_task = tokio::spawn(log_stderr(stderr));
        self.tasks.lock().expect("tasks lock poisoned").extend([reader, stderr_task]);
        *self.child.lock().await = Some(child);

        let handshake = tokio::time::timeout(
            Duration::from_millis(self.config.startup_timeout_ms),
            self.shared.send_request(JsonRpcRequest::new("health", Some(json!({})))),
        )
        .await;

        let response = match handshake {
            Err(_) => {
                self.kill().await;
                return Err(WorkerError::StartupTimeout(self.config.startup_timeout_ms));
            }
            Ok(Err(e)) => {
                self.kill().await;
                return Err(e);
            }
            Ok(Ok(response)) => response,
        };

        if let Some(error) = response.error {
            self.kill().await;
            return Err(WorkerError::StartupFailed(error.message));
        }
        let health: HealthResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null))
                .map_err(|e| WorkerError::StartupFailed(e.to_string()))?;
        if health.status != "ok" {
            self.kill().await;
            return Err(WorkerError::StartupFailed(format!(
                "health status {}",
                health.status
            )));
        }

        self.shared.ready.store(true, Ordering::SeqCst);
        tracing::info!(runtime = %health.runtime, version = ?health.version, "worker ready");
        Ok(())
    }

    /// Execute a trik action in the worker.
    ///
    /// The storage context (if any) is bound for the duration of the call so
    /// the worker's `storage.*` requests resolve against it, and unbound on
    /// every exit path. `timeout_ms` overrides the configured invoke timeout
    /// when the trik's manifest declares a tighter execution budget.
    #[instrument(skip_all, fields(trik_path, action))]
    pub async fn invoke(
        &self,
        trik_path: &str,
        action: &str,
        input: Value,
        session: Option<Value>,
        config: Option<BTreeMap<String, String>>,
        storage: Option<Arc<dyn StorageContext>>,
        timeout_ms: Option<u64>,
    ) -> Result<InvokeResult> {
        if !self.is_ready() {
            self.start().await?;
        }

        *self.shared.storage.lock().await = storage;

        let params = InvokeParams {
            trik_path: trik_path.to_string(),
            action: action.to_string(),
            input,
            session,
            config,
        };
        let request = JsonRpcRequest::new("invoke", Some(serde_json::to_value(&params)?));
        let request_id = request.id.clone();

        let timeout_ms = timeout_ms.unwrap_or(self.config.invoke_timeout_ms);
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.shared.send_request(request),
        )
        .await;

        *self.shared.storage.lock().await = None;

        let response = match outcome {
            Err(_) => {
                self.shared.take_pending(&request_id);
                return Err(WorkerError::InvokeTimeout(timeout_ms));
            }
            Ok(result) => result?,
        };

        if let Some(error) = response.error {
            return Err(WorkerError::Rpc { code: error.code, message: error.message });
        }
        match response.result {
            Some(result) if !result.is_null() => Ok(serde_json::from_value(result)?),
            _ => Ok(InvokeResult::default()),
        }
    }

    /// Round-trip a health check against the running worker.
    pub async fn health(&self) -> Result<HealthResult> {
        let response = self
            .shared
            .send_request(JsonRpcRequest::new("health", Some(json!({}))))
            .await?;
        if let Some(error) = response.error {
            return Err(WorkerError::Rpc { code: error.code, message: error.message });
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    /// Ask the worker to exit, then kill it after the grace period.
    pub async fn shutdown(&self, grace_period_ms: u64) {
        let started = self.shared.writer.lock().await.is_some();
        if started {
            let request =
                JsonRpcRequest::new("shutdown", Some(json!({ "gracePeriodMs": grace_period_ms })));
            let _ = tokio::time::timeout(
                Duration::from_millis(grace_period_ms + 1000),
                self.shared.send_request(request),
            )
            .await;
        }
        self.kill().await;
    }

    /// Terminate the process and fail everything in flight.
    pub async fn kill(&self) {
        self.shared.ready.store(false, Ordering::SeqCst);
        *self.shared.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("worker kill: {e}");
            }
        }

        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
        self.shared.fail_pending();
    }
}
