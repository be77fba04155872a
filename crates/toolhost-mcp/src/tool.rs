//! Exposes an MCP server tool as a `toolhost_types::Tool`.

use crate::client::{McpClient, McpToolInfo};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use toolhost_types::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

/// Budget for restarting a dead server from inside a tool call.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes of stderr quoted when a server cannot be brought back.
const STDERR_TAIL_BYTES: usize = 500;

/// Qualified registry name for a tool: `mcp_<server>_<tool>`.
pub fn qualified_name(server_name: &str, tool_name: &str) -> String {
    format!("mcp_{server_name}_{tool_name}")
}

/// A tool backed by an MCP server.
///
/// Each McpTool represents one tool from one MCP server. The qualified name
/// keeps tools from different servers apart in a shared registry. If the
/// server has died, a call restarts it once before giving up.
pub struct McpTool {
    qualified_name: String,
    server_name: String,
    tool_info: McpToolInfo,
    call_timeout: Duration,
    client: Arc<McpClient>,
}

impl McpTool {
    /// Create a new MCP tool wrapper. `server_name` must already be sanitized.
    pub fn new(
        client: Arc<McpClient>,
        server_name: &str,
        mut tool_info: McpToolInfo,
        call_timeout: Duration,
    ) -> Self {
        if tool_info.description.is_empty() {
            tool_info.description = format!("MCP tool from {server_name}");
        }
        if tool_info.input_schema.is_null() {
            tool_info.input_schema = serde_json::json!({"type": "object", "properties": {}});
        }
        let call_timeout = if call_timeout.is_zero() {
            crate::config::DEFAULT_CALL_TIMEOUT
        } else {
            call_timeout
        };

        Self {
            qualified_name: qualified_name(server_name, &tool_info.name),
            server_name: server_name.to_string(),
            tool_info,
            call_timeout,
            client,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn invoke(&self, input: serde_json::Value) -> Result<String, ToolError> {
        if !self.client.is_alive() {
            tracing::info!(
                "[{}] Server down, reconnecting before {}",
                self.server_name,
                self.tool_info.name
            );
            if let Err(e) = self.client.revive(RECONNECT_TIMEOUT).await {
                let stderr = self.client.stderr_tail(STDERR_TAIL_BYTES);
                let mut message = format!(
                    "MCP server {} is down and reconnect failed: {}",
                    self.server_name, e
                );
                if !stderr.is_empty() {
                    tracing::error!("[{}] stderr: {}", self.server_name, stderr);
                    message.push_str(&format!("\nstderr: {stderr}"));
                }
                return Err(ToolError::ExecutionFailed(message));
            }
        }

        let first = self
            .client
            .call_tool(&self.tool_info.name, input.clone(), Some(self.call_timeout))
            .await;

        let original = match first {
            Ok(text) => return Ok(text),
            // Only a death during the call earns a retry.
            Err(e) if self.client.is_alive() => return Err(e.into()),
            Err(e) => e,
        };

        tracing::info!(
            "[{}] Server died during call, retrying {}",
            self.server_name,
            self.tool_info.name
        );
        if let Err(reconnect_err) = self.client.revive(RECONNECT_TIMEOUT).await {
            return Err(ToolError::ExecutionFailed(format!(
                "MCP server {} crashed: {} (original: {})",
                self.server_name, reconnect_err, original
            )));
        }

        self.client
            .call_tool(&self.tool_info.name, input, Some(self.call_timeout))
            .await
            .map_err(|retry_err| {
                ToolError::ExecutionFailed(format!(
                    "MCP server {} failed again after reconnect: {} (original: {})",
                    self.server_name, retry_err, original
                ))
            })
    }
}

impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.qualified_name.clone(),
            description: format!("[MCP: {}] {}", self.server_name, self.tool_info.description),
            input_schema: self.tool_info.input_schema.clone(),
        }
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + '_>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
                result = self.invoke(input) => result.map(ToolOutput::text),
            }
        })
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool")
            .field("name", &self.qualified_name)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_tool_info() -> McpToolInfo {
        McpToolInfo {
            name: "read_file".to_string(),
            description: "Read a file from disk".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                },
                "required": ["path"]
            }),
        }
    }

    // `cat` stands in for a server: it never completes a handshake, which
    // is all these tests need.
    fn idle_client() -> Arc<McpClient> {
        Arc::new(McpClient::spawn("idle", "cat", &[], HashMap::new()).unwrap())
    }

    #[test]
    fn qualified_name_format() {
        assert_eq!(qualified_name("filesystem", "read_file"), "mcp_filesystem_read_file");
    }

    #[tokio::test]
    async fn definition_includes_server_prefix() {
        let client = idle_client();
        let tool = McpTool::new(
            Arc::clone(&client),
            "github",
            sample_tool_info(),
            Duration::from_secs(10),
        );
        let def = tool.definition();
        assert_eq!(def.name, "mcp_github_read_file");
        assert_eq!(def.description, "[MCP: github] Read a file from disk");
        assert_eq!(def.input_schema["required"][0], "path");
        assert_eq!(tool.call_timeout(), Duration::from_secs(10));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_description_and_schema_get_defaults() {
        let client = idle_client();
        let info = McpToolInfo {
            name: "echo".to_string(),
            description: String::new(),
            input_schema: serde_json::Value::Null,
        };
        let tool = McpTool::new(Arc::clone(&client), "fixture", info, Duration::ZERO);
        let def = tool.definition();
        assert_eq!(def.description, "[MCP: fixture] MCP tool from fixture");
        assert_eq!(
            def.input_schema,
            serde_json::json!({"type": "object", "properties": {}})
        );
        assert_eq!(tool.call_timeout(), crate::config::DEFAULT_CALL_TIMEOUT);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_stops_execution() {
        let client = idle_client();
        let tool = McpTool::new(
            Arc::clone(&client),
            "idle",
            sample_tool_info(),
            Duration::from_secs(10),
        );
        let ctx = ToolContext::default();
        ctx.cancel.cancel();
        // The idle client is never alive, so without cancellation this would
        // spend the reconnect budget.
        let result = tool.execute(serde_json::json!({}), ctx).await;
        assert!(matches!(result, Err(ToolError::Cancelled)));
        client.close().await.unwrap();
    }

    #[test]
    fn mcp_tool_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<McpTool>();
    }
}
