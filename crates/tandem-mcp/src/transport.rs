use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tandem_core::config::TransportConfig;
use tandem_core::error::Result;

use crate::teardown::TeardownStack;

/// A capability advertised by a tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }
}

/// Result of invoking a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text content, one block per line.
    pub content: String,
    /// The provider reported the call itself as failed.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Request/response surface of an initialized provider connection.
pub trait ToolClient: Send + Sync + 'static {
    /// List available capabilities.
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolInfo>>>;

    /// Invoke a capability by name.
    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Option<Map<String, Value>>,
    ) -> BoxFuture<'a, Result<ToolOutput>>;

    /// Whether the underlying transport is still usable.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Opens a provider connection for one transport kind.
///
/// Implementations push every resource they acquire onto `resources` as soon
/// as it exists, so a failed or cancelled handshake can still be unwound by
/// the caller.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        server: &'a str,
        transport: &'a TransportConfig,
        resources: &'a mut TeardownStack,
    ) -> BoxFuture<'a, Result<Arc<dyn ToolClient>>>;
}
