//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP server '{name}' is not running")]
    ServerNotRunning { name: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server '{name}' closed")]
    Closed { name: String },

    #[error("MCP server '{name}' was replaced or shut down")]
    Retired { name: String },

    #[error("MCP server '{server}' timed out on {method} after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("MCP tool error: {detail}")]
    ToolFailed {
        server: String,
        tool: String,
        detail: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<McpError> for toolhost_types::ToolError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Timeout { timeout_ms, .. } => Self::Timeout { timeout_ms },
            McpError::ToolFailed { detail, .. } => Self::ExecutionFailed(detail),
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhost_types::ToolError;

    #[test]
    fn tool_failure_keeps_detail_verbatim() {
        let err: ToolError = McpError::ToolFailed {
            server: "fs".into(),
            tool: "read".into(),
            detail: "boom".into(),
        }
        .into();
        assert!(matches!(err, ToolError::ExecutionFailed(ref d) if d == "boom"));
    }

    #[test]
    fn timeout_maps_to_tool_timeout() {
        let err: ToolError = McpError::Timeout {
            server: "fs".into(),
            method: "tools/call".into(),
            timeout_ms: 200,
        }
        .into();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 200 }));
    }
}
