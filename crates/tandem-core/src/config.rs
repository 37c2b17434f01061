use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};

/// Handshake deadline for stdio servers. Local process start-up can be slow.
pub const DEFAULT_STDIO_HANDSHAKE_SECS: u64 = 60;
/// Handshake deadline for network transports.
pub const DEFAULT_REMOTE_HANDSHAKE_SECS: u64 = 5;

/// Top-level Tandem configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Configuration for a single tool-provider server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// Overrides the per-kind handshake deadline.
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// Per-tool-call timeout in seconds. Default: 120.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Tool names to expose (empty = all tools).
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    300
}

fn default_terminate_on_close() -> bool {
    true
}

/// Transport configuration, one variant per supported transport kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
        #[serde(default = "default_read_timeout")]
        read_timeout_secs: u64,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
        #[serde(default = "default_read_timeout")]
        read_timeout_secs: u64,
        #[serde(default = "default_terminate_on_close")]
        terminate_on_close: bool,
    },
}

/// Transport kind, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        };
        f.write_str(s)
    }
}

impl TransportKind {
    pub fn default_handshake_timeout(self) -> Duration {
        match self {
            Self::Stdio => Duration::from_secs(DEFAULT_STDIO_HANDSHAKE_SECS),
            Self::Sse | Self::StreamableHttp => {
                Duration::from_secs(DEFAULT_REMOTE_HANDSHAKE_SECS)
            }
        }
    }
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }

    /// Create a stdio transport with no extra environment.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Create a streamable-HTTP transport with default timeouts.
    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self::StreamableHttp {
            url: url.into(),
            headers: HashMap::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            terminate_on_close: default_terminate_on_close(),
        }
    }

    /// Create an SSE transport with default timeouts.
    pub fn sse(url: impl Into<String>) -> Self {
        Self::Sse {
            url: url.into(),
            headers: HashMap::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }

    /// Check that the parameters can be used to open a connection.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(TandemError::Configuration(
                        "stdio transport requires a command".into(),
                    ));
                }
                Ok(())
            }
            Self::Sse {
                url,
                headers,
                connect_timeout_secs,
                read_timeout_secs,
            }
            | Self::StreamableHttp {
                url,
                headers,
                connect_timeout_secs,
                read_timeout_secs,
                ..
            } => {
                validate_url(url)?;
                validate_headers(headers)?;
                if *connect_timeout_secs == 0 || *read_timeout_secs == 0 {
                    return Err(TandemError::Configuration(format!(
                        "{} transport for {} requires non-zero timeouts",
                        self.kind(),
                        url
                    )));
                }
                Ok(())
            }
        }
    }
}

fn validate_url(url: &str) -> Result<()> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| TandemError::Configuration(format!("Invalid URL '{}': {}", url, e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.host().is_some() => Ok(()),
        _ => Err(TandemError::Configuration(format!(
            "URL '{}' must be an absolute http(s) URL",
            url
        ))),
    }
}

fn validate_headers(headers: &HashMap<String, String>) -> Result<()> {
    for (name, value) in headers {
        http::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TandemError::Configuration(format!("Invalid header name '{}': {}", name, e))
        })?;
        http::HeaderValue::from_str(value).map_err(|e| {
            TandemError::Configuration(format!("Invalid value for header '{}': {}", name, e))
        })?;
    }
    Ok(())
}

impl ServerConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            handshake_timeout_secs: None,
            request_timeout_secs: default_request_timeout(),
            tools: vec![],
        }
    }

    /// Set an explicit handshake deadline.
    pub fn with_handshake_timeout(mut self, secs: u64) -> Self {
        self.handshake_timeout_secs = Some(secs);
        self
    }

    /// Set the per-call timeout.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Restrict the exposed tools.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Deadline for the transport handshake.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.transport.kind().default_handshake_timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.handshake_timeout_secs == Some(0) {
            return Err(TandemError::Configuration(
                "handshake_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(TandemError::Configuration(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Project-level MCP server config from .mcp.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpJsonConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, McpJsonServerEntry>,
}

/// A single entry in .mcp.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpJsonServerEntry {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl McpJsonServerEntry {
    /// Convert to ServerConfig.
    pub fn to_server_config(&self) -> Option<ServerConfig> {
        let transport = if let Some(ref cmd) = self.command {
            TransportConfig::Stdio {
                command: cmd.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
                cwd: None,
            }
        } else if let Some(ref url) = self.url {
            TransportConfig::StreamableHttp {
                url: url.clone(),
                headers: self.headers.clone(),
                connect_timeout_secs: default_connect_timeout(),
                read_timeout_secs: default_read_timeout(),
                terminate_on_close: default_terminate_on_close(),
            }
        } else {
            return None;
        };

        Some(ServerConfig::new(transport))
    }
}

impl McpJsonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TandemError::ConfigNotFound(path.display().to_string()))?;
        Ok(serde_json::from_str(&expand_env_vars(&content))?)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TandemError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| TandemError::Configuration(e.to_string()))
    }

    /// Merge servers from a .mcp.json file. Servers already present win.
    pub fn merge_mcp_json(&mut self, json: &McpJsonConfig) -> usize {
        let mut added = 0;
        for (name, entry) in &json.mcp_servers {
            if self.mcp.servers.contains_key(name) {
                continue;
            }
            if let Some(server) = entry.to_server_config() {
                self.mcp.servers.insert(name.clone(), server);
                added += 1;
            } else {
                tracing::warn!(server = %name, "Skipping .mcp.json entry without command or url");
            }
        }
        added
    }

    /// Validate every configured server.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&String> = self.mcp.servers.keys().collect();
        names.sort();
        for name in names {
            self.mcp.servers[name].validate().map_err(|e| match e {
                TandemError::Configuration(msg) => {
                    TandemError::Configuration(format!("server '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
