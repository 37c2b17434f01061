use chrono::{DateTime, Utc};

/// Lifecycle notifications for tool-provider sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected {
        server: String,
        at: DateTime<Utc>,
    },
    HandshakeFailed {
        server: String,
        error: String,
    },
    Closed {
        server: String,
    },
    ToolsChanged {
        server: String,
    },
    LogMessage {
        server: String,
        level: String,
        message: String,
    },
}

impl SessionEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::Connected { server, .. }
            | Self::HandshakeFailed { server, .. }
            | Self::Closed { server }
            | Self::ToolsChanged { server }
            | Self::LogMessage { server, .. } => server,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
