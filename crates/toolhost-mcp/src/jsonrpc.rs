//! JSON-RPC 2.0 framing for MCP communication.

use serde::{Deserialize, Serialize};

/// Error code for a server-initiated request we do not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> JsonRpcRequest<'a> {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> JsonRpcNotification<'a> {
    /// Create a new JSON-RPC notification.
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Our answer to a request the server sent us.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any frame the server writes to its stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// How the reader should treat an incoming frame.
#[derive(Debug)]
pub enum Incoming {
    /// Server-pushed notification: method, no id.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Server-initiated request that expects a reply.
    Request {
        id: serde_json::Value,
        method: String,
    },
    /// Response to one of our requests.
    Response {
        id: u64,
        outcome: Result<serde_json::Value, JsonRpcError>,
    },
    /// Nothing we can route (no method, no usable id).
    Unroutable,
}

impl JsonRpcMessage {
    pub fn classify(self) -> Incoming {
        match (self.method, self.id) {
            (Some(method), None) => Incoming::Notification {
                method,
                params: self.params,
            },
            (Some(method), Some(id)) => Incoming::Request { id, method },
            (None, Some(id)) => match id.as_u64() {
                Some(id) => Incoming::Response {
                    id,
                    outcome: match self.error {
                        Some(err) => Err(err),
                        None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
                    },
                },
                None => Incoming::Unroutable,
            },
            (None, None) => Incoming::Unroutable,
        }
    }
}
