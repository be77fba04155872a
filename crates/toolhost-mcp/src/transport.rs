//! Stdio transport for MCP server communication.
//!
//! A `StdioTransport` owns exactly one spawned process: its stdin (behind a
//! write lock), the table of requests waiting for a response, and the
//! background task reading newline-delimited JSON-RPC frames from stdout.
//! A client replaces its transport wholesale when it reconnects.

use crate::error::McpError;
use crate::jsonrpc::{
    Incoming, JsonRpcMessage, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, METHOD_NOT_FOUND,
};
use crate::stderr::StderrBuffer;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read buffer for server stdout; tool results can be large.
const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// How long teardown waits for the reader after the process has exited.
const READER_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Callback for server-pushed notifications. Runs on the reader task.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<&serde_json::Value>) + Send + Sync>;

type Slot = oneshot::Sender<Result<serde_json::Value, McpError>>;

/// Everything needed to (re)start a server process.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Client-level state that outlives any single process.
pub(crate) struct Shared {
    pub name: String,
    pub stderr: StderrBuffer,
    pub handler: RwLock<Option<NotificationHandler>>,
}

impl Shared {
    pub fn new(name: String) -> Self {
        Self {
            name,
            stderr: StderrBuffer::default(),
            handler: RwLock::new(None),
        }
    }

    fn handler(&self) -> Option<NotificationHandler> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// The half of a transport the reader task holds on to.
///
/// Kept apart from the `Child` so dropping the transport kills the process
/// even while the reader is still parked on stdout.
struct Wire {
    name: String,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<u64, Slot>>,
    open: AtomicBool,
    closed: CancellationToken,
}

impl Wire {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(&self) -> McpError {
        McpError::Closed {
            name: self.name.clone(),
        }
    }

    async fn write_frame<T: Serialize>(&self, frame: &T) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let stdin = writer.as_mut().ok_or_else(|| self.closed_error())?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Mark the process gone and fail every waiting request. Idempotent.
    fn finish(&self) {
        self.open.store(false, Ordering::SeqCst);
        let orphaned: Vec<Slot> = self.pending().drain().map(|(_, slot)| slot).collect();
        if !orphaned.is_empty() {
            tracing::debug!(
                "[{}] failing {} pending request(s)",
                self.name,
                orphaned.len()
            );
        }
        for slot in orphaned {
            let _ = slot.send(Err(self.closed_error()));
        }
        self.closed.cancel();
    }

    fn dispatch(self: &Arc<Self>, shared: &Shared, msg: JsonRpcMessage) {
        match msg.classify() {
            Incoming::Response { id, outcome } => {
                let slot = self.pending().remove(&id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(outcome.map_err(|e| McpError::JsonRpc {
                            server: self.name.clone(),
                            code: e.code,
                            message: e.message,
                        }));
                    }
                    None => {
                        tracing::debug!("[{}] dropping response for unknown id {}", self.name, id)
                    }
                }
            }
            Incoming::Notification { method, params } => {
                tracing::debug!("[{}] notification: {}", self.name, method);
                if let Some(handler) = shared.handler() {
                    handler(method.as_str(), params.as_ref());
                }
            }
            Incoming::Request { id, method } => {
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, serde_json::json!({}))
                } else {
                    tracing::debug!("[{}] unsupported server request: {}", self.name, method);
                    JsonRpcReply::error(id, METHOD_NOT_FOUND, "Method not found")
                };
                // Off the reader: a full stdin pipe must not stall stdout.
                let wire = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = wire.write_frame(&reply).await {
                        tracing::debug!("[{}] failed to answer server request: {}", wire.name, e);
                    }
                });
            }
            Incoming::Unroutable => {
                tracing::debug!("[{}] dropping frame with no method or id", self.name)
            }
        }
    }
}

/// Runs `Wire::finish` however the reader ends, including panic or abort.
struct FinishOnDrop(Arc<Wire>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Removes a request's slot when its caller stops waiting for any reason.
struct PendingGuard<'a> {
    wire: &'a Wire,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.wire.pending().remove(&self.id);
    }
}

/// Async stdio transport for communicating with an MCP server process.
pub(crate) struct StdioTransport {
    wire: Arc<Wire>,
    ready: AtomicBool,
    child: tokio::sync::Mutex<Child>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the process and start the stdout reader and stderr capture.
    pub fn spawn(spec: &LaunchSpec, shared: &Arc<Shared>) -> Result<Arc<Self>, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: shared.name.clone(),
            source: e,
        })?;

        let missing = |what: &str| McpError::Protocol(format!("{what} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let capture = Arc::clone(shared);
        tokio::spawn(async move { capture.stderr.capture(stderr).await });

        let wire = Arc::new(Wire {
            name: shared.name.clone(),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&wire), Arc::clone(shared), stdout));

        Ok(Arc::new(Self {
            wire,
            ready: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(child),
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Whether the process is still running (reader has not terminated).
    pub fn is_open(&self) -> bool {
        self.wire.open.load(Ordering::SeqCst)
    }

    /// Whether the handshake has completed on this process.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        self.wire.pending().len()
    }

    /// Send a request and wait for its response, the timeout, or process death.
    ///
    /// Dropping the returned future abandons the request and removes its slot.
    pub async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_open() {
            return Err(McpError::ServerNotRunning {
                name: self.wire.name.clone(),
            });
        }

        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.wire.pending().insert(id, tx);
        let _guard = PendingGuard {
            wire: &self.wire,
            id,
        };

        self.wire.write_frame(&request).await?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or_else(|_| Err(self.wire.closed_error())),
            _ = self.wire.closed.cancelled() => Err(self.wire.closed_error()),
            _ = deadline => Err(McpError::Timeout {
                server: self.wire.name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
            }),
        }
    }

    /// Send a notification (fire-and-forget, no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.wire
            .write_frame(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Close stdin, kill the process, and wait until the reader has exited.
    pub async fn terminate(&self) {
        self.try_close_stdin();
        {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        // The kill unblocks any in-flight write, so this cannot hang.
        self.wire.writer.lock().await.take();
        self.join_reader().await;
    }

    /// Close stdin and give the process `timeout` to exit on its own.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), McpError> {
        if !self.is_open() {
            self.terminate().await;
            return Ok(());
        }

        self.try_close_stdin();
        let killed = {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(_) => None,
                Err(_) => {
                    tracing::info!(
                        "[{}] Graceful shutdown timed out, killing",
                        self.wire.name
                    );
                    Some(child.kill().await)
                }
            }
        };
        self.wire.writer.lock().await.take();
        self.join_reader().await;

        match killed {
            Some(Err(e)) => Err(McpError::Io(e)),
            _ => Ok(()),
        }
    }

    /// Drop stdin unless a write currently holds it.
    fn try_close_stdin(&self) {
        if let Ok(mut writer) = self.wire.writer.try_lock() {
            writer.take();
        }
    }

    async fn join_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(READER_JOIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                // A grandchild can keep stdout open after the server dies.
                tracing::warn!("[{}] reader still running after exit, aborting", self.wire.name);
                handle.abort();
                let _ = handle.await;
            }
        }
        self.wire.finish();
    }
}

async fn read_loop(wire: Arc<Wire>, shared: Arc<Shared>, stdout: ChildStdout) {
    let _finish = FinishOnDrop(Arc::clone(&wire));
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("[{}] read error: {}", wire.name, e);
                break;
            }
        }

        // Some servers log plain text to stdout; only objects can be frames.
        let frame = line.trim_ascii();
        if frame.first() != Some(&b'{') {
            continue;
        }

        match serde_json::from_slice::<JsonRpcMessage>(frame) {
            Ok(msg) => wire.dispatch(&shared, msg),
            Err(e) => tracing::debug!("[{}] dropping malformed frame: {}", wire.name, e),
        }
    }

    tracing::debug!("[{}] stdout closed", wire.name);
}
