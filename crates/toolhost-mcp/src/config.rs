//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use toolhost_types::ConfigError;

/// Per-call timeout used when a server does not configure a positive one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Load from a TOML file. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No MCP config at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides; values may reference `$VAR` / `${VAR}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Skip this server entirely.
    #[serde(default)]
    pub disabled: bool,
    /// Per tool-call timeout in seconds (default: 60).
    #[serde(default)]
    pub call_timeout: Option<i64>,
}

impl McpServerConfig {
    /// The effective per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        match self.call_timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Environment overrides with host variables substituted.
    pub fn expanded_env(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect()
    }
}

/// Substitute `$NAME` and `${NAME}` with values from the process environment.
///
/// Unset variables expand to the empty string. A `$` that does not start a
/// valid name is kept as-is.
pub fn expand_env(value: &str) -> String {
    expand_with(value, |name| std::env::var(name).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                if !name.is_empty() {
                    out.push_str(&lookup(name).unwrap_or_default());
                    rest = &braced[end + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = after;
            continue;
        }

        let starts_name = after.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_');
        if !starts_name {
            out.push('$');
            rest = after;
            continue;
        }
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        out.push_str(&lookup(&after[..len]).unwrap_or_default());
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}
