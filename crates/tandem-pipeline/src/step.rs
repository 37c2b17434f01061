use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;

use tandem_core::error::{Result, TandemError};

use crate::state::{SharedState, HALT_KEY};

/// Opaque unit of work. Receives the step's declared inputs, returns a value or a fault.
pub type WorkFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Evaluated against the shared state before a step runs; `true` skips it.
pub type SkipPredicate = Arc<dyn Fn(&SharedState) -> bool + Send + Sync>;

/// What a work function sees of the run.
///
/// Holds a copy of the keys the step declared as inputs, plus a handle for
/// requesting the short-circuit flag. Work functions never touch the shared
/// state directly; the orchestrator applies their output and halt request.
#[derive(Debug, Clone)]
pub struct StepContext {
    step_id: String,
    inputs: IndexMap<String, Value>,
    halt: Arc<AtomicBool>,
}

impl StepContext {
    pub fn new(step_id: impl Into<String>, inputs: IndexMap<String, Value>) -> Self {
        Self {
            step_id: step_id.into(),
            inputs,
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Get a declared input. Undeclared or not-yet-produced keys read as `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Get a declared input, failing the step if it is absent.
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key).ok_or_else(|| {
            TandemError::step(&self.step_id, format!("missing input '{}'", key))
        })
    }

    pub fn inputs(&self) -> &IndexMap<String, Value> {
        &self.inputs
    }

    /// Ask the orchestrator to skip every step that has not started yet.
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub(crate) fn halt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halt)
    }
}

/// Smallest schedulable unit: one work function plus its declared keys.
#[derive(Clone)]
pub struct Step {
    id: String,
    input_keys: Vec<String>,
    output_key: Option<String>,
    work: WorkFn,
    skip_if: Option<SkipPredicate>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("input_keys", &self.input_keys)
            .field("output_key", &self.output_key)
            .field("skip_if", &self.skip_if.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Step {
    /// Create a step from an async work function.
    pub fn new<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let work: WorkFn = Arc::new(move |ctx| work(ctx).boxed());
        Self {
            id: id.into(),
            input_keys: vec![],
            output_key: None,
            work,
            skip_if: None,
            timeout: None,
        }
    }

    /// Create a step from a synchronous work function.
    pub fn from_fn<F>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn(&StepContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(id, move |ctx| futures::future::ready(work(&ctx)))
    }

    /// Set the keys this step reads.
    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the key this step's result is written to.
    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Skip this step when the predicate holds.
    pub fn skip_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SharedState) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    /// Fail the step if its work function runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub(crate) fn should_skip(&self, state: &SharedState) -> bool {
        self.skip_if.as_ref().is_some_and(|p| p(state))
    }

    /// Build the context for one invocation from the current state.
    pub(crate) fn context(&self, state: &SharedState) -> StepContext {
        let inputs = self
            .input_keys
            .iter()
            .filter_map(|k| state.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        StepContext::new(&self.id, inputs)
    }

    /// Run the work function, turning panics and timeouts into errors.
    pub(crate) async fn invoke(&self, ctx: StepContext) -> Result<Value> {
        let work = Arc::clone(&self.work);
        let guarded = AssertUnwindSafe(async move { work(ctx).await }).catch_unwind();

        let caught = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => {
                    return Err(TandemError::StepTimeout {
                        step: self.id.clone(),
                        timeout_secs: limit.as_secs(),
                    })
                }
            },
            None => guarded.await,
        };

        caught.unwrap_or_else(|panic| Err(TandemError::step(&self.id, panic_message(&*panic))))
    }

    pub(crate) fn declares_halt(&self) -> bool {
        self.output_key.as_deref() == Some(HALT_KEY)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
