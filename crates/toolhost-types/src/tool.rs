//! Tool trait and related types.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// A tool definition handed to whoever drives the registry (name, description, input schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Cancelled by the caller when the invocation should be abandoned.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context that is cancelled together with `cancel`.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output content blocks.
    pub content: Vec<ToolOutputContent>,
    /// Whether the tool execution resulted in an error.
    pub is_error: bool,
}

/// A single piece of tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutputContent {
    Text { text: String },
}

impl ToolOutput {
    /// Create a successful text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolOutputContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Concatenate every text block, newline separated.
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolOutputContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Trait that all tools must implement.
pub trait Tool: Send + Sync {
    /// The unique name of this tool (the key it is registered under).
    fn name(&self) -> &str;

    /// The tool definition (name, description, input schema).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input and context.
    ///
    /// The context is passed by value to avoid lifetime issues with dyn dispatch.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + '_>>;
}

/// Anything that accepts tools by name.
///
/// Registering a name that is already present replaces the previous tool.
pub trait ToolRegistrar: Send + Sync {
    fn register(&self, tool: Arc<dyn Tool>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_output_is_not_error() {
        let out = ToolOutput::text("hello");
        assert!(!out.is_error);
        assert_eq!(out.to_text(), "hello");
    }

    #[test]
    fn to_text_joins_blocks() {
        let out = ToolOutput {
            content: vec![
                ToolOutputContent::Text { text: "a".into() },
                ToolOutputContent::Text { text: "b".into() },
            ],
            is_error: false,
        };
        assert_eq!(out.to_text(), "a\nb");
    }

    #[test]
    fn default_context_is_not_cancelled() {
        let ctx = ToolContext::default();
        assert!(!ctx.cancel.is_cancelled());
    }
}
