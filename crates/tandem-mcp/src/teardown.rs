use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use tandem_core::error::Result;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Resources acquired while opening a session, released in reverse order.
///
/// Every push registers how to release one resource. `close` runs the
/// releases last-in first-out; a failing release is logged and the rest
/// still run. Once closed the stack is empty, so closing again does nothing.
#[derive(Default)]
pub struct TeardownStack {
    server: String,
    entries: Vec<(String, Release)>,
}

impl std::fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownStack")
            .field("server", &self.server)
            .field("resources", &self.resources())
            .finish()
    }
}

impl TeardownStack {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            entries: Vec::new(),
        }
    }

    /// Register a release action for a freshly acquired resource.
    pub fn push<F, Fut>(&mut self, resource: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let resource = resource.into();
        debug!(server = %self.server, resource = %resource, "Resource acquired");
        self.entries
            .push((resource, Box::new(move || release().boxed())));
    }

    /// Names of the resources still held, in acquisition order.
    pub fn resources(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything in reverse acquisition order.
    ///
    /// Returns how many releases failed. Failures are never propagated.
    pub async fn close(&mut self) -> usize {
        let mut failures = 0;
        while let Some((resource, release)) = self.entries.pop() {
            match release().await {
                Ok(()) => {
                    debug!(server = %self.server, resource = %resource, "Resource released");
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        server = %self.server,
                        resource = %resource,
                        error = %e,
                        "Teardown warning: resource did not release cleanly"
                    );
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tandem_core::error::TandemError;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &str,
        fail: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static {
        let log = Arc::clone(log);
        let name = name.to_string();
        move || -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                log.lock().unwrap().push(name.clone());
                if fail {
                    Err(TandemError::Teardown {
                        resource: name,
                        message: "already gone".into(),
                    })
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_releases_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new("files");
        stack.push("tracker", recorder(&log, "tracker", false));
        stack.push("protocol session", recorder(&log, "protocol session", false));
        stack.push("pipes", recorder(&log, "pipes", false));
        assert_eq!(stack.resources(), vec!["tracker", "protocol session", "pipes"]);

        assert_eq!(stack.close().await, 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["pipes", "protocol session", "tracker"]
        );
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_remaining() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new("files");
        stack.push("first", recorder(&log, "first", false));
        stack.push("broken", recorder(&log, "broken", true));
        stack.push("last", recorder(&log, "last", false));

        assert_eq!(stack.close().await, 1);
        assert_eq!(*log.lock().unwrap(), vec!["last", "broken", "first"]);
    }

    #[tokio::test]
    async fn test_second_close_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new("files");
        stack.push("only", recorder(&log, "only", false));

        stack.close().await;
        stack.close().await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
