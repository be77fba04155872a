//! MCP (Model Context Protocol) client implementation for toolhost.
//!
//! Supports stdio-based MCP servers that communicate via newline-delimited
//! JSON-RPC 2.0 messages. Each configured server is spawned as a child process,
//! initialized with a handshake, and its tools are discovered and registered.
//! Servers that die are restarted on the next call to one of their tools.

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod stderr;
pub mod tool;
mod transport;

pub use client::{ClientState, McpClient, McpToolContent, McpToolInfo};
pub use config::{McpConfig, McpServerConfig, expand_env};
pub use error::McpError;
pub use manager::{McpManager, ServerStatus, TOOLS_LIST_CHANGED, sanitize_name};
pub use tool::{McpTool, qualified_name};
pub use transport::NotificationHandler;
