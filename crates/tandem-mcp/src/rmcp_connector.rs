use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use rmcp::model::CallToolRequestParams;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{RoleClient, ServiceExt};

use tandem_core::config::TransportConfig;
use tandem_core::error::{Result, TandemError};
use tandem_core::event::EventBus;

use crate::handler::TandemClientHandler;
use crate::teardown::TeardownStack;
use crate::transport::{Connector, ToolClient, ToolInfo, ToolOutput};

type McpConnection = RunningService<RoleClient, TandemClientHandler>;

/// Opens MCP sessions with `rmcp`.
///
/// stdio servers are spawned with `kill_on_drop`, so cancelling the
/// handshake also reaps the child. SSE and streamable-HTTP servers share
/// rmcp's streamable HTTP client transport, configured with the server's
/// headers and connect/read timeouts.
#[derive(Clone, Default)]
pub struct RmcpConnector {
    events: EventBus,
}

impl RmcpConnector {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

impl Connector for RmcpConnector {
    fn connect<'a>(
        &'a self,
        server: &'a str,
        transport: &'a TransportConfig,
        resources: &'a mut TeardownStack,
    ) -> BoxFuture<'a, Result<Arc<dyn ToolClient>>> {
        Box::pin(async move {
            if let Some(caveat) = transport_caveat(transport) {
                warn!(server = %server, kind = %transport.kind(), "{}", caveat);
            }
            let handler = TandemClientHandler::new(server, self.events.clone());

            let (service, terminate_on_close) = match transport {
                TransportConfig::Stdio {
                    command,
                    args,
                    env,
                    cwd,
                } => {
                    let mut cmd = tokio::process::Command::new(command);
                    cmd.args(args).kill_on_drop(true);
                    for (k, v) in env {
                        cmd.env(k, v);
                    }
                    if let Some(dir) = cwd {
                        cmd.current_dir(dir);
                    }

                    let transport = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                        handshake_error(server, format!("failed to spawn {}: {}", command, e))
                    })?;

                    let service = handler.serve(transport).await.map_err(|e| {
                        handshake_error(server, format!("MCP initialize failed: {}", e))
                    })?;
                    (service, true)
                }
                TransportConfig::Sse {
                    url,
                    headers,
                    connect_timeout_secs,
                    read_timeout_secs,
                } => {
                    let client = http_client(server, headers, *connect_timeout_secs, *read_timeout_secs)?;
                    (serve_http(server, handler, client, url).await?, true)
                }
                TransportConfig::StreamableHttp {
                    url,
                    headers,
                    connect_timeout_secs,
                    read_timeout_secs,
                    terminate_on_close,
                } => {
                    let client = http_client(server, headers, *connect_timeout_secs, *read_timeout_secs)?;
                    (
                        serve_http(server, handler, client, url).await?,
                        *terminate_on_close,
                    )
                }
            };

            info!(server = %server, kind = %transport.kind(), "MCP server connected");

            let alive = Arc::new(AtomicBool::new(true));
            let client = RmcpClient {
                server: server.to_string(),
                peer: service.peer().clone(),
                alive: Arc::clone(&alive),
            };

            let name = server.to_string();
            resources.push("mcp session", move || release_service(name, service, alive, terminate_on_close));

            Ok(Arc::new(client) as Arc<dyn ToolClient>)
        })
    }
}

async fn serve_http(
    server: &str,
    handler: TandemClientHandler,
    client: reqwest::Client,
    url: &str,
) -> Result<McpConnection> {
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url),
    );

    <TandemClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
        .await
        .map_err(|e| handshake_error(server, format!("MCP initialize failed: {}", e)))
}

fn http_client(
    server: &str,
    headers: &HashMap<String, String>,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<reqwest::Client> {
    let mut header_map = http::HeaderMap::new();
    for (key, value) in headers {
        let name = http::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TandemError::Configuration(format!("header '{}': {}", key, e)))?;
        let value = http::HeaderValue::from_str(value)
            .map_err(|e| TandemError::Configuration(format!("header '{}': {}", key, e)))?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .read_timeout(Duration::from_secs(read_timeout_secs))
        .build()
        .map_err(|e| handshake_error(server, format!("failed to build HTTP client: {}", e)))
}

async fn release_service(
    server: String,
    mut service: McpConnection,
    alive: Arc<AtomicBool>,
    terminate_on_close: bool,
) -> Result<()> {
    alive.store(false, Ordering::SeqCst);
    if !terminate_on_close {
        // Dropping the service stops the local worker without waiting on the remote end.
        debug!(server = %server, "Dropping MCP session without remote termination");
        drop(service);
        return Ok(());
    }
    service
        .close()
        .await
        .map(|_| ())
        .map_err(|e| TandemError::Teardown {
            resource: format!("mcp session '{}'", server),
            message: e.to_string(),
        })
}

/// Operator-facing note for transports that are only approximated.
fn transport_caveat(transport: &TransportConfig) -> Option<&'static str> {
    match transport {
        TransportConfig::Sse { .. } => Some(
            "SSE transport is served over the streamable HTTP client; SSE-only endpoints will fail the handshake",
        ),
        _ => None,
    }
}

fn handshake_error(server: &str, message: String) -> TandemError {
    TandemError::Handshake {
        server: server.to_string(),
        message,
    }
}

/// Request side of an rmcp session.
struct RmcpClient {
    server: String,
    peer: Peer<RoleClient>,
    alive: Arc<AtomicBool>,
}

impl RmcpClient {
    fn check_transport(&self, err: &str) {
        if err.contains("closed") || err.contains("Transport") {
            self.alive.store(false, Ordering::SeqCst);
        }
    }
}

impl ToolClient for RmcpClient {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolInfo>>> {
        Box::pin(async move {
            let tools = self.peer.list_all_tools().await.map_err(|e| {
                let err = e.to_string();
                self.check_transport(&err);
                TandemError::Mcp(format!("Failed to list tools from '{}': {}", self.server, err))
            })?;

            Ok(tools
                .into_iter()
                .map(|tool| ToolInfo {
                    description: tool
                        .description
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| format!("MCP tool: {}", tool.name)),
                    input_schema: serde_json::to_value(&*tool.input_schema)
                        .unwrap_or(serde_json::json!({"type": "object"})),
                    name: tool.name.to_string(),
                })
                .collect())
        })
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Option<Map<String, Value>>,
    ) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            let params = CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                meta: None,
                task: None,
            };

            let result = self.peer.call_tool(params).await.map_err(|e| {
                let err = e.to_string();
                self.check_transport(&err);
                TandemError::Mcp(format!(
                    "Tool call '{}.{}' failed: {}",
                    self.server, name, err
                ))
            })?;

            // Convert result content to string
            let content: Vec<String> = result
                .content
                .iter()
                .map(|c| match c.raw {
                    rmcp::model::RawContent::Text(ref t) => t.text.to_string(),
                    _ => format!("{:?}", c.raw),
                })
                .collect();

            Ok(ToolOutput {
                content: content.join("\n"),
                is_error: result.is_error.unwrap_or(false),
            })
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
