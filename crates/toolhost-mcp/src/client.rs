//! MCP client for a single server connection.
//!
//! Handles the MCP protocol handshake (initialize + initialized notification),
//! paginated tool discovery (tools/list), tool invocation (tools/call), and
//! restarting the server process in place when it dies.

use crate::error::McpError;
use crate::transport::{LaunchSpec, NotificationHandler, Shared, StdioTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// MCP protocol version we support.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// How long `close()` waits for the server to exit after stdin is closed.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Lifecycle of a client's current server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    /// Process spawned, handshake not yet completed.
    Starting,
    /// Handshake completed and the process is running.
    Alive,
    /// Process exited or was killed.
    Dead,
}

/// A content block in a tool result.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

impl McpToolContent {
    /// Render this block as plain text for the caller.
    pub fn render(&self) -> String {
        match self.kind.as_str() {
            "text" => self.text.clone().unwrap_or_default(),
            "image" => format!(
                "[image: {}, {} bytes base64]",
                self.mime_type
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("image/unknown"),
                self.data.as_deref().map_or(0, str::len)
            ),
            _ => self.text.clone().unwrap_or_default(),
        }
    }
}

/// Join rendered content blocks with newlines.
pub fn render_content(content: &[McpToolContent]) -> String {
    content
        .iter()
        .map(McpToolContent::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deserialization helpers for MCP protocol messages.
#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<ToolEntry>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<serde_json::Value>,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl From<ToolEntry> for McpToolInfo {
    fn from(entry: ToolEntry) -> Self {
        Self {
            name: entry.name,
            description: entry.description.unwrap_or_default(),
            input_schema: entry
                .input_schema
                .filter(|s| !s.is_null())
                .unwrap_or_else(default_schema),
        }
    }
}

#[derive(Deserialize)]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<McpToolContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

/// Client for a single MCP server.
///
/// The client keeps its identity across process restarts: `reconnect`
/// swaps in a fresh process behind the same `McpClient`.
pub struct McpClient {
    shared: Arc<Shared>,
    launch: LaunchSpec,
    next_id: AtomicU64,
    transport: RwLock<Arc<StdioTransport>>,
    reconnect_gate: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl McpClient {
    /// Spawn the server process. The handshake is a separate step (`initialize`).
    pub fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let shared = Arc::new(Shared::new(name.into()));
        let launch = LaunchSpec {
            command: command.to_string(),
            args: args.to_vec(),
            env,
        };
        let transport = StdioTransport::spawn(&launch, &shared)?;

        Ok(Self {
            shared,
            launch,
            next_id: AtomicU64::new(1),
            transport: RwLock::new(transport),
            reconnect_gate: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        })
    }

    fn transport(&self) -> Arc<StdioTransport> {
        Arc::clone(&self.transport.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Send a request on the current process and wait for its result.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport()
            .request(id, method, params, timeout)
            .await
    }

    /// Send a notification on the current process.
    pub(crate) async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.transport().notify(method, None).await
    }

    /// Perform the MCP initialize handshake.
    pub async fn initialize(&self, timeout: Duration) -> Result<(), McpError> {
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolhost",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let transport = self.transport();
        let handshake = async {
            let result = self
                .call("initialize", Some(init_params), Some(timeout))
                .await?;
            if let Some(info) = result.get("serverInfo") {
                tracing::debug!("[{}] server info: {}", self.shared.name, info);
            }
            self.notify("notifications/initialized").await
        }
        .await;

        // A process that cannot complete the handshake is never usable.
        if let Err(e) = handshake {
            transport.terminate().await;
            return Err(e);
        }
        transport.mark_ready();
        Ok(())
    }

    /// Discover every tool the server exposes, following `nextCursor` pages.
    ///
    /// `timeout` bounds the whole discovery, not each page.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolInfo>, McpError> {
        let deadline = Instant::now() + timeout;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = self
                .call("tools/list", Some(params), Some(remaining))
                .await
                .map_err(|e| match e {
                    McpError::Timeout { server, method, .. } => McpError::Timeout {
                        server,
                        method,
                        timeout_ms: timeout.as_millis() as u64,
                    },
                    other => other,
                })?;

            let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
            })?;
            tools.extend(page.tools.into_iter().map(McpToolInfo::from));

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::debug!("[{}] discovered {} tools", self.shared.name, tools.len());
        Ok(tools)
    }

    /// Call a tool and render its content blocks as text.
    ///
    /// A zero timeout means no per-call limit. A result flagged `isError`
    /// comes back as `McpError::ToolFailed` carrying the rendered content.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<String, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let result = self
            .call("tools/call", Some(params), timeout.filter(|t| !t.is_zero()))
            .await?;

        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;

        let rendered = render_content(&call_result.content);
        if call_result.is_error {
            return Err(McpError::ToolFailed {
                server: self.shared.name.clone(),
                tool: tool_name.to_string(),
                detail: rendered,
            });
        }
        Ok(rendered)
    }

    /// Kill the current process, start a fresh one, and redo the handshake.
    pub async fn reconnect(&self, timeout: Duration) -> Result<(), McpError> {
        let _gate = self.reconnect_gate.lock().await;
        self.restart(timeout).await
    }

    /// Reconnect only if the server is not alive once we hold the gate.
    ///
    /// Returns whether a restart happened. Callers racing on the same dead
    /// server restart it once; the rest find it alive and return `false`.
    /// A retired client is never revived.
    pub async fn revive(&self, timeout: Duration) -> Result<bool, McpError> {
        let _gate = self.reconnect_gate.lock().await;
        if self.is_alive() {
            return Ok(false);
        }
        if self.is_retired() {
            return Err(McpError::Retired {
                name: self.shared.name.clone(),
            });
        }
        self.restart(timeout).await.map(|()| true)
    }

    async fn restart(&self, timeout: Duration) -> Result<(), McpError> {
        tracing::info!("[{}] Reconnecting...", self.shared.name);

        self.transport().terminate().await;

        let fresh = StdioTransport::spawn(&self.launch, &self.shared)?;
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.initialize(timeout).await?;

        tracing::info!("[{}] Reconnected successfully", self.shared.name);
        Ok(())
    }

    /// Stop `revive` from ever restarting this client.
    ///
    /// Used when the owner has replaced or shut down the server, so stale
    /// handles cannot bring a second process up under the same name.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Close stdin, wait up to `timeout` for the server to exit, then kill it.
    pub async fn graceful_close(&self, timeout: Duration) -> Result<(), McpError> {
        self.transport().shutdown(timeout).await
    }

    /// Shut down the server connection.
    pub async fn close(&self) -> Result<(), McpError> {
        self.graceful_close(GRACEFUL_CLOSE_TIMEOUT).await
    }

    pub fn state(&self) -> ClientState {
        let transport = self.transport();
        if !transport.is_open() {
            ClientState::Dead
        } else if transport.is_ready() {
            ClientState::Alive
        } else {
            ClientState::Starting
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ClientState::Alive
    }

    /// Register the callback for server-pushed notifications.
    ///
    /// It runs on the reader task, so it must return quickly; hand real work
    /// off to a spawned task.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&str, Option<&serde_json::Value>) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Captured stderr (most recent bytes only).
    pub fn stderr(&self) -> String {
        self.shared.stderr.contents()
    }

    /// The last `max` bytes of captured stderr.
    pub fn stderr_tail(&self, max: usize) -> String {
        self.shared.stderr.tail(max)
    }

    /// Requests sent on the current process that are still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.transport().pending_len()
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.shared.name
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.shared.name)
            .field("command", &self.launch.command)
            .field("state", &self.state())
            .finish()
    }
}
