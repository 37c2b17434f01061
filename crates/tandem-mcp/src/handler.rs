use std::future::Future;

use tracing::debug;

use rmcp::handler::client::ClientHandler;
use rmcp::model::*;
use rmcp::service::NotificationContext;
use rmcp::RoleClient;

use tandem_core::event::{EventBus, SessionEvent};

/// MCP client handler that forwards server notifications to the event bus.
pub struct TandemClientHandler {
    server_name: String,
    events: EventBus,
}

impl TandemClientHandler {
    pub fn new(server_name: &str, events: EventBus) -> Self {
        Self {
            server_name: server_name.to_string(),
            events,
        }
    }
}

#[allow(clippy::manual_async_fn)]
impl ClientHandler for TandemClientHandler {
    fn on_tool_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "MCP tools/list_changed notification");
            self.events.publish(SessionEvent::ToolsChanged {
                server: self.server_name.clone(),
            });
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let level = format!("{:?}", params.level);
            let message = params.data.to_string();
            debug!(server = %self.server_name, level = %level, "MCP log: {}", message);
            self.events.publish(SessionEvent::LogMessage {
                server: self.server_name.clone(),
                level,
                message,
            });
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "tandem".into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}
