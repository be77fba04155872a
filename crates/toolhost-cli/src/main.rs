//! toolhost CLI: connect MCP servers over stdio and use their tools.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolhost_mcp::{McpConfig, McpManager};
use toolhost_tools::ToolRegistry;
use toolhost_types::{ToolContext, ToolError, ToolRegistrar};

#[derive(Parser)]
#[command(name = "toolhost", version, about = "Run local MCP tool servers")]
struct Cli {
    /// Path to the server config (default: ~/.toolhost/mcp.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every tool discovered from the configured servers
    List,
    /// Show whether each configured server is alive
    Status,
    /// Invoke a tool by its qualified name (mcp_<server>_<tool>)
    Call {
        name: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = McpConfig::load(&path).map_err(|e| anyhow::anyhow!("{e}"))?;
    if config.servers.is_empty() {
        bail!("No MCP servers configured in {}", path.display());
    }

    let registry = Arc::new(ToolRegistry::new());
    let manager =
        McpManager::new().with_registry(Arc::clone(&registry) as Arc<dyn ToolRegistrar>);
    for tool in manager.connect_all(&config.servers).await {
        registry.register(Arc::new(tool));
    }

    let result = run(cli.command, &manager, &registry).await;
    manager.close().await;
    result
}

async fn run(command: Command, manager: &McpManager, registry: &ToolRegistry) -> Result<()> {
    match command {
        Command::List => {
            let defs = registry.definitions();
            if defs.is_empty() {
                println!("No tools available.");
            }
            for def in defs {
                println!("{}\n  {}", def.name, def.description);
            }
        }
        Command::Status => {
            let status = manager.server_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Call { name, args } => {
            let input = parse_args(&name, &args)?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let output = registry
                .execute(&name, input, ToolContext::with_cancel(cancel))
                .await
                .with_context(|| format!("Tool {name} failed"))?;
            println!("{}", output.to_text());
            if output.is_error {
                bail!("Tool {name} reported an error");
            }
        }
    }
    Ok(())
}

/// Tool arguments must be a JSON object.
fn parse_args(tool: &str, raw: &str) -> Result<serde_json::Value, ToolError> {
    let invalid = |message: String| ToolError::InvalidInput {
        tool: tool.to_string(),
        message,
    };
    let input: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| invalid(format!("--args is not valid JSON: {e}")))?;
    if !input.is_object() {
        return Err(invalid("--args must be a JSON object".to_string()));
    }
    Ok(input)
}

/// Config file location when `--config` is not given.
fn default_config_path() -> PathBuf {
    resolve_config_path(
        std::env::var_os("TOOLHOST_CONFIG_DIR").map(PathBuf::from),
        dirs_next::home_dir(),
    )
}

fn resolve_config_path(config_dir: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    let dir = config_dir.unwrap_or_else(|| {
        home.unwrap_or_else(|| PathBuf::from("."))
            .join(".toolhost")
    });
    dir.join("mcp.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_dir_override_wins() {
        let path = resolve_config_path(Some(PathBuf::from("/etc/toolhost")), Some("/home/me".into()));
        assert_eq!(path, PathBuf::from("/etc/toolhost/mcp.toml"));
    }

    #[test]
    fn falls_back_to_home() {
        let path = resolve_config_path(None, Some(PathBuf::from("/home/me")));
        assert_eq!(path, PathBuf::from("/home/me/.toolhost/mcp.toml"));
    }

    #[test]
    fn parses_call_with_args() {
        let cli = Cli::try_parse_from([
            "toolhost",
            "--verbose",
            "call",
            "mcp_fs_read",
            "--args",
            r#"{"path":"a"}"#,
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Call { name, args } => {
                assert_eq!(name, "mcp_fs_read");
                assert_eq!(args, r#"{"path":"a"}"#);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn args_must_be_a_json_object() {
        assert_eq!(parse_args("t", r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(matches!(
            parse_args("t", "[1, 2]"),
            Err(ToolError::InvalidInput { ref tool, ref message })
                if tool == "t" && message.contains("JSON object")
        ));
        assert!(matches!(
            parse_args("t", "{oops"),
            Err(ToolError::InvalidInput { ref message, .. }) if message.contains("not valid JSON")
        ));
    }

    #[test]
    fn call_args_default_to_empty_object() {
        let cli = Cli::try_parse_from(["toolhost", "call", "mcp_fs_list", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Command::Call { ref args, .. } if args == "{}"));
    }
}
