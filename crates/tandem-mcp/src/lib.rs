//! Lifecycle management for sessions to out-of-process MCP tool providers.
//!
//! A [`SessionManager`] owns at most one [`TransportSession`] and opens it
//! on first [`acquire`](SessionManager::acquire), under a per-transport
//! handshake deadline. Every resource a handshake acquires goes onto a
//! [`TeardownStack`] and is released in reverse order on close or failure.

mod handler;
mod manager;
mod registry;
mod rmcp_connector;
mod session;
mod teardown;
mod toolset;
mod transport;

pub use handler::TandemClientHandler;
pub use manager::SessionManager;
pub use registry::McpRegistry;
pub use rmcp_connector::RmcpConnector;
pub use session::{SessionStatus, TransportSession};
pub use teardown::TeardownStack;
pub use toolset::{McpToolset, ToolFilter};
pub use transport::{Connector, ToolClient, ToolInfo, ToolOutput};
