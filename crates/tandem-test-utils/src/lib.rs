//! Shared test fixtures: counting steps, a scripted connector, and a mock
//! tool client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use tandem_core::config::{ServerConfig, TransportConfig};
use tandem_core::error::{Result, TandemError};
use tandem_mcp::{Connector, TeardownStack, ToolClient, ToolInfo, ToolOutput};
use tandem_pipeline::Step;

/// Counts how often the steps built from it were invoked.
#[derive(Debug, Clone, Default)]
pub struct SpyCounter(Arc<AtomicUsize>);

impl SpyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// A step that records the call and returns `value`.
    pub fn step(&self, id: &str, value: Value) -> Step {
        let counter = Arc::clone(&self.0);
        Step::from_fn(id, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value.clone())
        })
    }

    /// A step that records the call and fails.
    pub fn failing_step(&self, id: &str, message: &str) -> Step {
        let counter = Arc::clone(&self.0);
        let message = message.to_string();
        Step::from_fn(id, move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TandemError::step(ctx.step_id(), message.clone()))
        })
    }

    /// A step that records the call, requests a halt, and returns `value`.
    pub fn halting_step(&self, id: &str, value: Value) -> Step {
        let counter = Arc::clone(&self.0);
        Step::from_fn(id, move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.request_halt();
            Ok(value.clone())
        })
    }
}

/// A step that sleeps for `delay` before returning `value`.
pub fn sleepy_step(id: &str, delay: Duration, value: Value) -> Step {
    Step::new(id, move |_| {
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    })
}

/// A stdio server config pointing at a command that is never spawned.
pub fn stdio_server() -> ServerConfig {
    ServerConfig::new(TransportConfig::stdio("mock-mcp", Vec::<String>::new()))
}

/// A streamable-HTTP server config for a local URL that is never contacted.
pub fn http_server() -> ServerConfig {
    ServerConfig::new(TransportConfig::streamable_http("http://127.0.0.1:9/mcp"))
}

/// Tool client serving canned responses.
///
/// Unknown tools answer with a provider-side error output. Tools without a
/// canned response echo their arguments back as JSON.
#[derive(Debug, Default)]
pub struct MockToolClient {
    tools: Vec<ToolInfo>,
    responses: HashMap<String, ToolOutput>,
    calls: Mutex<Vec<(String, Option<Map<String, Value>>)>>,
    listings: AtomicUsize,
    dead: AtomicBool,
}

impl MockToolClient {
    pub fn new(tools: Vec<ToolInfo>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }

    pub fn with_response(mut self, tool: &str, output: ToolOutput) -> Self {
        self.responses.insert(tool.to_string(), output);
        self
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<(String, Option<Map<String, Value>>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of tool listings served.
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Simulate the transport dropping.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

impl ToolClient for MockToolClient {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ToolInfo>>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.tools.clone()) })
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Option<Map<String, Value>>,
    ) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));

            if !self.tools.iter().any(|t| t.name == name) {
                return Ok(ToolOutput::error(format!("unknown tool: {}", name)));
            }
            if let Some(output) = self.responses.get(name) {
                return Ok(output.clone());
            }
            let echoed = Value::Object(arguments.unwrap_or_default()).to_string();
            Ok(ToolOutput::success(echoed))
        })
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }
}

/// Connector with scripted handshake behavior.
///
/// Each attempt pushes the configured resources onto the teardown stack
/// before waiting out its delay, so a timed-out or failed attempt still has
/// something to release. Releases are appended to a shared log.
pub struct MockConnector {
    tools: Vec<ToolInfo>,
    responses: Vec<(String, ToolOutput)>,
    resources: Vec<String>,
    delays: Mutex<VecDeque<Duration>>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    released: Arc<Mutex<Vec<String>>>,
    clients: Mutex<Vec<Arc<MockToolClient>>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            tools: vec![],
            responses: vec![],
            resources: vec!["process".into(), "pipes".into(), "session".into()],
            delays: Mutex::new(VecDeque::new()),
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            released: Arc::new(Mutex::new(Vec::new())),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolInfo>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response(mut self, tool: &str, output: ToolOutput) -> Self {
        self.responses.push((tool.to_string(), output));
        self
    }

    pub fn with_resources(mut self, resources: &[&str]) -> Self {
        self.resources = resources.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Delay the next attempts by these amounts, one per attempt.
    pub fn with_delays(self, delays: Vec<Duration>) -> Self {
        *self.delays.lock().unwrap() = delays.into();
        self
    }

    /// Fail the next `n` attempts after their resources are acquired.
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Handshake attempts started.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Resources released so far, in release order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// The client handed out by the most recent successful attempt.
    pub fn last_client(&self) -> Option<Arc<MockToolClient>> {
        self.clients.lock().unwrap().last().cloned()
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        _server: &'a str,
        _transport: &'a TransportConfig,
        resources: &'a mut TeardownStack,
    ) -> BoxFuture<'a, Result<Arc<dyn ToolClient>>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            for resource in &self.resources {
                let log = Arc::clone(&self.released);
                let name = format!("{}#{}", resource, attempt);
                resources.push(resource.clone(), move || async move {
                    log.lock().unwrap().push(name);
                    Ok(())
                });
            }

            let delay = self.delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(TandemError::Mcp(format!("scripted failure #{}", attempt)));
            }

            let mut client = MockToolClient::new(self.tools.clone());
            for (tool, output) in &self.responses {
                client = client.with_response(tool, output.clone());
            }
            let client = Arc::new(client);
            self.clients.lock().unwrap().push(Arc::clone(&client));
            Ok(client as Arc<dyn ToolClient>)
        })
    }
}
