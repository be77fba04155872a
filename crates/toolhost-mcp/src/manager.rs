//! Orchestrates connections to several MCP servers.

use crate::client::{ClientState, McpClient};
use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::tool::McpTool;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use toolhost_types::ToolRegistrar;

/// Budget for spawn + handshake + discovery of one server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for re-discovery after a tools/list_changed notification.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes of stderr included in a dead server's status.
const STATUS_STDERR_BYTES: usize = 500;

/// Server-pushed notification that the tool catalog changed.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Liveness report for one managed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub alive: bool,
    pub state: ClientState,
    /// Tail of captured stderr, only for servers that are not alive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stderr: Option<String>,
}

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    configs: RwLock<HashMap<String, McpServerConfig>>,
    registry: Option<Arc<dyn ToolRegistrar>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            registry: None,
        }
    }

    /// Registry that refreshed tools are written back into when a server
    /// reports its tool list changed.
    pub fn with_registry(mut self, registry: Arc<dyn ToolRegistrar>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Start all enabled servers and discover their tools.
    ///
    /// Servers that fail to spawn, handshake, or list tools are logged and
    /// skipped; the rest are unaffected. Tools are returned grouped by
    /// server name in sorted order.
    pub async fn connect_all(&self, servers: &HashMap<String, McpServerConfig>) -> Vec<McpTool> {
        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();

        let attempts = names.into_iter().filter_map(|name| {
            let config = &servers[name];
            if config.disabled {
                tracing::info!("Skipping disabled MCP server: {}", name);
                return None;
            }
            Some(async move { (name, config, self.connect_server(name, config).await) })
        });

        let mut all_tools = Vec::new();
        for (name, config, result) in join_all(attempts).await {
            match result {
                Ok((client, tools)) => {
                    tracing::info!("Connected MCP server {}: {} tools", name, tools.len());
                    self.adopt(name, client, config).await;
                    all_tools.extend(tools);
                }
                Err(e) => {
                    tracing::warn!("Failed to connect MCP server {}: {}", name, e);
                }
            }
        }
        all_tools
    }

    async fn connect_server(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<(Arc<McpClient>, Vec<McpTool>), McpError> {
        let client = Arc::new(McpClient::spawn(
            name,
            &config.command,
            &config.args,
            config.expanded_env(),
        )?);

        let safe_name = sanitize_name(name);
        let call_timeout = config.call_timeout();
        self.watch_tool_changes(&client, safe_name.clone(), call_timeout);

        let started = Instant::now();
        let discovered = async {
            client.initialize(CONNECT_TIMEOUT).await?;
            client
                .list_tools(CONNECT_TIMEOUT.saturating_sub(started.elapsed()))
                .await
        }
        .await;

        let infos = match discovered {
            Ok(infos) => infos,
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    tracing::debug!("[{}] close after failed connect: {}", name, close_err);
                }
                return Err(e);
            }
        };

        let tools = infos
            .into_iter()
            .map(|info| McpTool::new(Arc::clone(&client), &safe_name, info, call_timeout))
            .collect();
        Ok((client, tools))
    }

    /// Route tools/list_changed for this client to a background refresh.
    fn watch_tool_changes(&self, client: &Arc<McpClient>, safe_name: String, call_timeout: Duration) {
        let weak = Arc::downgrade(client);
        let registry = self.registry.clone();
        let name = client.server_name().to_string();

        client.set_notification_handler(move |method, _params| {
            tracing::info!("[{}] Notification: {}", name, method);
            if method != TOOLS_LIST_CHANGED {
                return;
            }
            let (Some(client), Some(registry)) = (weak.upgrade(), registry.clone()) else {
                return;
            };
            // The reader is the only thing that can deliver the refresh's
            // responses, so the refresh must not run on it.
            tokio::spawn(refresh_tools(client, registry, safe_name.clone(), call_timeout));
        });
    }

    /// Take ownership of a connected client, retiring and closing any
    /// previous one of the same name.
    async fn adopt(&self, name: &str, client: Arc<McpClient>, config: &McpServerConfig) {
        let previous = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), client);
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), config.clone());

        if let Some(previous) = previous {
            tracing::info!("Replacing MCP server: {}", name);
            // Tools still holding the old client must not restart it.
            previous.retire();
            if let Err(e) = previous.close().await {
                tracing::warn!("[{}] error closing replaced server: {}", name, e);
            }
        }
    }

    /// Liveness for every managed server, with recent stderr for dead ones.
    pub fn server_status(&self) -> BTreeMap<String, ServerStatus> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, client)| {
                let state = client.state();
                let alive = state == ClientState::Alive;
                let last_stderr = if alive {
                    None
                } else {
                    Some(client.stderr_tail(STATUS_STDERR_BYTES)).filter(|s| !s.is_empty())
                };
                (
                    name.clone(),
                    ServerStatus {
                        alive,
                        state,
                        last_stderr,
                    },
                )
            })
            .collect()
    }

    /// Look up a managed client by server name.
    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// The configuration a managed server was connected with.
    pub fn config(&self, name: &str) -> Option<McpServerConfig> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Names of managed servers, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of connected servers.
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gracefully shut down and retire every managed server. Best-effort.
    pub async fn close(&self) {
        let mut clients: Vec<(String, Arc<McpClient>)> = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        clients.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, client) in clients {
            tracing::info!("Closing MCP server: {}", name);
            client.retire();
            if let Err(e) = client.close().await {
                tracing::warn!("[{}] error during shutdown: {}", name, e);
            }
        }
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-discover a server's tools and overwrite them in the registry.
async fn refresh_tools(
    client: Arc<McpClient>,
    registry: Arc<dyn ToolRegistrar>,
    safe_name: String,
    call_timeout: Duration,
) {
    let infos = match client.list_tools(REFRESH_TIMEOUT).await {
        Ok(infos) => infos,
        Err(e) => {
            tracing::warn!("[{}] Failed to refresh tools: {}", client.server_name(), e);
            return;
        }
    };

    let count = infos.len();
    for info in infos {
        registry.register(Arc::new(McpTool::new(
            Arc::clone(&client),
            &safe_name,
            info,
            call_timeout,
        )));
    }
    tracing::info!(
        "[{}] Refreshed tools: {} available",
        client.server_name(),
        count
    );
}

/// Make a server name safe to embed in a qualified tool name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
