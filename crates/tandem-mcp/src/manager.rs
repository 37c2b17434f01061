use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use tandem_core::config::ServerConfig;
use tandem_core::error::{Result, TandemError};
use tandem_core::event::{EventBus, SessionEvent};

use crate::session::TransportSession;
use crate::transport::Connector;

/// How the most recent handshake attempt ended, replayed to callers that
/// were queued behind it.
#[derive(Debug, Clone)]
enum AttemptFailure {
    Timeout { timeout_secs: u64 },
    Failed { message: String },
}

impl AttemptFailure {
    fn from_error(error: &TandemError) -> Self {
        match error {
            TandemError::HandshakeTimeout { timeout_secs, .. } => Self::Timeout {
                timeout_secs: *timeout_secs,
            },
            TandemError::Handshake { message, .. } => Self::Failed {
                message: message.clone(),
            },
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self, server: &str) -> TandemError {
        match self {
            Self::Timeout { timeout_secs } => TandemError::HandshakeTimeout {
                server: server.to_string(),
                timeout_secs: *timeout_secs,
            },
            Self::Failed { message } => TandemError::Handshake {
                server: server.to_string(),
                message: message.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<TransportSession>>,
    last_failure: Option<AttemptFailure>,
}

/// Single-flight owner of at most one [`TransportSession`] for one provider.
///
/// The slot lock is held for the whole handshake, so it doubles as the
/// construction-in-progress marker: concurrent `acquire` calls queue on it
/// and then observe the session the first caller built. Callers that queued
/// behind a failed attempt receive that attempt's error instead of starting
/// their own; a later `acquire` starts fresh.
///
/// The handshake runs on its own task, which owns the slot lock until the
/// attempt settles. A caller that stops waiting leaves the attempt running,
/// so its resources end up either in the slot or released.
pub struct SessionManager {
    server: String,
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    events: Option<EventBus>,
    slot: Arc<Mutex<Slot>>,
    /// Handshake attempts finished, successful or not.
    finished: Arc<AtomicU64>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("server", &self.server)
            .field("kind", &self.config.transport.kind())
            .field("handshakes", &self.handshake_count())
            .finish()
    }
}

impl SessionManager {
    /// Create a manager. Fails with `Configuration` if the parameters are unusable.
    pub fn new(
        server: impl Into<String>,
        config: ServerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let server = server.into();
        config.validate().map_err(|e| match e {
            TandemError::Configuration(msg) => {
                TandemError::Configuration(format!("server '{}': {}", server, msg))
            }
            other => other,
        })?;

        Ok(Self {
            server,
            config,
            connector,
            events: None,
            slot: Arc::new(Mutex::new(Slot::default())),
            finished: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Publish session lifecycle events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of handshake attempts that have finished.
    pub fn handshake_count(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    fn publish(&self, event: SessionEvent) {
        publish(&self.events, event);
    }

    /// Return the live session, opening one if needed.
    pub async fn acquire(&self) -> Result<Arc<TransportSession>> {
        let observed = self.finished.load(Ordering::SeqCst);
        let slot = Arc::clone(&self.slot).lock_owned().await;

        let ready = slot.session.as_ref().filter(|s| s.is_ready()).cloned();
        if let Some(session) = ready {
            return Ok(session);
        }

        if slot.session.is_none() && self.finished.load(Ordering::SeqCst) != observed {
            // An attempt finished while we were queued and left no session.
            if let Some(failure) = &slot.last_failure {
                debug!(server = %self.server, "Sharing result of concurrent failed handshake");
                return Err(failure.to_error(&self.server));
            }
        }

        let attempt = Attempt {
            server: self.server.clone(),
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            events: self.events.clone(),
            finished: Arc::clone(&self.finished),
        };
        tokio::spawn(attempt.run(slot))
            .await
            .map_err(|e| TandemError::Handshake {
                server: self.server.clone(),
                message: format!("handshake task failed: {}", e),
            })?
    }

    /// The current session, without connecting.
    pub async fn current(&self) -> Option<Arc<TransportSession>> {
        self.slot.lock().await.session.clone()
    }

    /// Close the session, if any. Closing an already-closed manager is a no-op.
    ///
    /// Only the process-level shutdown path should call this; steps must
    /// never close sessions they acquired.
    pub async fn close(&self) {
        let session = self.slot.lock().await.session.take();
        match session {
            Some(session) => {
                session.close().await;
                self.publish(SessionEvent::Closed {
                    server: self.server.clone(),
                });
            }
            None => debug!(server = %self.server, "No session to close"),
        }
    }
}

fn publish(events: &Option<EventBus>, event: SessionEvent) {
    if let Some(bus) = events {
        bus.publish(event);
    }
}

/// One handshake attempt, detached from the caller that started it.
struct Attempt {
    server: String,
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    events: Option<EventBus>,
    finished: Arc<AtomicU64>,
}

impl Attempt {
    async fn run(self, mut slot: OwnedMutexGuard<Slot>) -> Result<Arc<TransportSession>> {
        if let Some(stale) = slot.session.take() {
            warn!(server = %self.server, "Session no longer alive, replacing it");
            stale.close().await;
            publish(
                &self.events,
                SessionEvent::Closed {
                    server: self.server.clone(),
                },
            );
        }

        let mut session = TransportSession::new(&self.server, &self.config);
        info!(
            server = %self.server,
            kind = %session.kind(),
            timeout_secs = session.handshake_timeout().as_secs(),
            "Opening session"
        );

        let result = session.handshake(self.connector.as_ref()).await;
        self.finished.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let session = Arc::new(session);
                slot.session = Some(Arc::clone(&session));
                slot.last_failure = None;
                publish(
                    &self.events,
                    SessionEvent::Connected {
                        server: self.server.clone(),
                        at: Utc::now(),
                    },
                );
                Ok(session)
            }
            Err(e) => {
                warn!(server = %self.server, error = %e, "Handshake failed");
                slot.last_failure = Some(AttemptFailure::from_error(&e));
                publish(
                    &self.events,
                    SessionEvent::HandshakeFailed {
                        server: self.server.clone(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }
}
