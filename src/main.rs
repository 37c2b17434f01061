use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tandem_core::config::{AppConfig, McpJsonConfig};
use tandem_core::event::SessionEvent;
use tandem_mcp::McpRegistry;

#[derive(Parser)]
#[command(name = "tandem", version, about = "Step pipelines over managed MCP sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tandem.toml", env = "TANDEM_CONFIG")]
    config: PathBuf,

    /// Skip merging .mcp.json from the current directory
    #[arg(long)]
    no_mcp_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and show the configured servers
    Check,
    /// Connect and list tools for one server, or all of them
    Tools {
        /// Server name (all servers if omitted)
        server: Option<String>,
    },
    /// Call one tool and print its output
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tandem=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config, !cli.no_mcp_json)?;
    config.validate()?;

    if let Commands::Check = cli.command {
        print_servers(&config);
        return Ok(());
    }

    let registry = McpRegistry::connect_with_rmcp(&config)?;
    let mut events = registry.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::LogMessage {
                    server,
                    level,
                    message,
                } => info!(server = %server, level = %level, "{}", message),
                SessionEvent::ToolsChanged { server } => {
                    info!(server = %server, "Server reported a tool list change")
                }
                other => debug!(server = %other.server(), event = ?other, "Session event"),
            }
        }
    });

    // Sessions are closed on every exit path past this point.
    let result = match cli.command {
        Commands::Check => Ok(()),
        Commands::Tools { server } => list_tools(&registry, server.as_deref()).await,
        Commands::Call { server, tool, args } => {
            call_tool(&registry, &server, &tool, args.as_deref()).await
        }
    };

    registry.shutdown_all().await;
    result
}

fn load_config(path: &Path, merge_mcp_json: bool) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        AppConfig::load(path)?
    } else {
        warn!(path = %path.display(), "Config file not found, using .mcp.json only");
        AppConfig::default()
    };

    if merge_mcp_json {
        if let Some(project) = load_mcp_json() {
            let added = config.merge_mcp_json(&project);
            info!(added, "Merged servers from .mcp.json");
        }
    }
    Ok(config)
}

/// Load .mcp.json from the current working directory.
fn load_mcp_json() -> Option<McpJsonConfig> {
    let path = std::env::current_dir().ok()?.join(".mcp.json");
    if !path.exists() {
        return None;
    }
    match McpJsonConfig::load(&path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded .mcp.json project config");
            Some(config)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse .mcp.json");
            None
        }
    }
}

fn print_servers(config: &AppConfig) {
    if config.mcp.servers.is_empty() {
        println!("No MCP servers configured.");
        return;
    }
    let mut names: Vec<&String> = config.mcp.servers.keys().collect();
    names.sort();
    println!("MCP Servers:");
    for name in names {
        let server = &config.mcp.servers[name];
        let filter = if server.tools.is_empty() {
            "all tools".to_string()
        } else {
            server.tools.join(", ")
        };
        println!(
            "  {} [{}] handshake {}s, request {}s ({})",
            name,
            server.transport.kind(),
            server.handshake_timeout().as_secs(),
            server.request_timeout().as_secs(),
            filter
        );
    }
}

async fn list_tools(registry: &McpRegistry, server: Option<&str>) -> anyhow::Result<()> {
    let servers: Vec<String> = match server {
        Some(name) => vec![name.to_string()],
        None => registry.servers().into_iter().map(String::from).collect(),
    };

    let mut failed = 0;
    for name in &servers {
        let toolset = registry.toolset(name)?;
        match toolset.tools().await {
            Ok(tools) => {
                println!("{} ({} tools)", name, tools.len());
                for tool in tools {
                    println!("  {:<28} {}", tool.name, tool.description);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{} (unavailable: {})", name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} servers unavailable", failed, servers.len());
    }
    Ok(())
}

async fn call_tool(
    registry: &McpRegistry,
    server: &str,
    tool: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = match args {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("--args must be valid JSON")?;
            match value {
                serde_json::Value::Object(map) => Some(map),
                _ => anyhow::bail!("--args must be a JSON object"),
            }
        }
        None => None,
    };

    let output = registry.toolset(server)?.call(tool, arguments).await?;
    println!("{}", output.content);
    if output.is_error {
        anyhow::bail!("tool '{}' reported an error", tool);
    }
    Ok(())
}
