use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tandem_core::config::{ServerConfig, TransportConfig, TransportKind};
use tandem_core::error::{Result, TandemError};

use crate::teardown::TeardownStack;
use crate::transport::{Connector, ToolClient, ToolInfo, ToolOutput};

/// Lifecycle of a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Uninitialized = 0,
    Ready = 1,
    Closed = 2,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// One connection to an external tool provider.
///
/// Starts `Uninitialized`, becomes `Ready` after a successful handshake and
/// `Closed` after `close` or a failed handshake. A closed session is never
/// reopened; the owning [`SessionManager`](crate::SessionManager) builds a
/// new one instead.
pub struct TransportSession {
    server: String,
    transport: TransportConfig,
    handshake_timeout: Duration,
    request_timeout: Duration,
    status: AtomicU8,
    client: Option<Arc<dyn ToolClient>>,
    teardown: Mutex<TeardownStack>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("server", &self.server)
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl TransportSession {
    pub fn new(server: impl Into<String>, config: &ServerConfig) -> Self {
        let server = server.into();
        Self {
            teardown: Mutex::new(TeardownStack::new(server.clone())),
            server,
            transport: config.transport.clone(),
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
            status: AtomicU8::new(SessionStatus::Uninitialized as u8),
            client: None,
            created_at: Utc::now(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Ready and the transport still reports itself alive.
    pub fn is_ready(&self) -> bool {
        self.status() == SessionStatus::Ready
            && self.client.as_ref().is_some_and(|c| c.is_alive())
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Run the transport handshake under the configured deadline.
    ///
    /// The handshake future is dropped when the deadline passes, cancelling
    /// it. On any failure the resources acquired so far are released and the
    /// session is closed.
    pub async fn handshake(&mut self, connector: &dyn Connector) -> Result<()> {
        if self.status() != SessionStatus::Uninitialized {
            return Err(TandemError::SessionClosed(self.server.clone()));
        }

        let deadline = self.handshake_timeout;
        let attempt = tokio::time::timeout(
            deadline,
            connector.connect(&self.server, &self.transport, self.teardown.get_mut()),
        )
        .await;

        let error = match attempt {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.set_status(SessionStatus::Ready);
                info!(
                    server = %self.server,
                    kind = %self.kind(),
                    resources = self.teardown.get_mut().len(),
                    "Session ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => match e {
                TandemError::Handshake { .. } | TandemError::Configuration(_) => e,
                other => TandemError::Handshake {
                    server: self.server.clone(),
                    message: other.to_string(),
                },
            },
            Err(_) => TandemError::HandshakeTimeout {
                server: self.server.clone(),
                timeout_secs: deadline.as_secs(),
            },
        };

        self.set_status(SessionStatus::Closed);
        let failures = self.teardown.get_mut().close().await;
        debug!(server = %self.server, failures, "Released resources after failed handshake");
        Err(error)
    }

    fn client(&self) -> Result<&Arc<dyn ToolClient>> {
        match (self.status(), self.client.as_ref()) {
            (SessionStatus::Ready, Some(client)) => Ok(client),
            _ => Err(TandemError::SessionClosed(self.server.clone())),
        }
    }

    /// List the provider's capabilities.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let client = self.client()?;
        let tools = tokio::time::timeout(self.request_timeout, client.list_tools())
            .await
            .map_err(|_| TandemError::ToolTimeout {
                tool: "tools/list".into(),
                timeout_secs: self.request_timeout.as_secs(),
            })??;
        debug!(server = %self.server, count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// Invoke a capability, bounded by the request timeout.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolOutput> {
        let client = self.client()?;
        debug!(server = %self.server, tool = %name, "Calling tool");
        tokio::time::timeout(self.request_timeout, client.call_tool(name, arguments))
            .await
            .map_err(|_| TandemError::ToolTimeout {
                tool: format!("{}.{}", self.server, name),
                timeout_secs: self.request_timeout.as_secs(),
            })?
    }

    /// Release transport resources in reverse acquisition order.
    ///
    /// Teardown failures are logged, never returned. Closing twice is a no-op.
    pub async fn close(&self) {
        let mut teardown = self.teardown.lock().await;
        let previous = SessionStatus::from_u8(
            self.status
                .swap(SessionStatus::Closed as u8, Ordering::SeqCst),
        );
        if previous == SessionStatus::Closed && teardown.is_empty() {
            debug!(server = %self.server, "Session already closed");
            return;
        }

        let failures = teardown.close().await;
        info!(server = %self.server, failures, "Session closed");
    }
}
