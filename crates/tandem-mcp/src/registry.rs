use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use tandem_core::config::AppConfig;
use tandem_core::error::{Result, TandemError};
use tandem_core::event::{EventBus, SessionEvent};

use crate::manager::SessionManager;
use crate::rmcp_connector::RmcpConnector;
use crate::toolset::McpToolset;
use crate::transport::Connector;

/// One [`SessionManager`] per configured server, plus process-level shutdown.
pub struct McpRegistry {
    managers: HashMap<String, Arc<SessionManager>>,
    events: EventBus,
}

impl McpRegistry {
    /// Build managers for every configured server. No connections are opened.
    pub fn from_config(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Result<Self> {
        let mut managers = HashMap::new();
        for (name, server) in &config.mcp.servers {
            let manager = SessionManager::new(name, server.clone(), Arc::clone(&connector))?
                .with_events(events.clone());
            managers.insert(name.clone(), Arc::new(manager));
        }
        Ok(Self { managers, events })
    }

    /// Build managers backed by the rmcp connector.
    pub fn connect_with_rmcp(config: &AppConfig) -> Result<Self> {
        let events = EventBus::default();
        let connector = Arc::new(RmcpConnector::new(events.clone()));
        Self::from_config(config, connector, events)
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Configured server names, sorted.
    pub fn servers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.managers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn manager(&self, server: &str) -> Result<Arc<SessionManager>> {
        self.managers
            .get(server)
            .cloned()
            .ok_or_else(|| TandemError::Mcp(format!("Server '{}' not configured", server)))
    }

    /// Toolset for a server, filtered by its configured tool list.
    pub fn toolset(&self, server: &str) -> Result<McpToolset> {
        Ok(McpToolset::from_manager(self.manager(server)?))
    }

    /// Close every open session. Safe to call more than once.
    pub async fn shutdown_all(&self) {
        for name in self.servers() {
            if let Some(manager) = self.managers.get(name) {
                manager.close().await;
            }
        }
        info!(servers = self.managers.len(), "All MCP sessions shut down");
    }
}
