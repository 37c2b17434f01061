use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use tandem_core::error::{Result, TandemError};

use crate::group::{GroupMode, Node, StepGroup};
use crate::outcome::{NodeKind, Outcome, RunEvent, RunReport};
use crate::state::SharedState;
use crate::step::Step;

/// Drives a [`StepGroup`] tree against a [`SharedState`].
///
/// Sequential groups run their children in order and check the `halt` flag
/// before each one. Parallel groups check it once on entry, then dispatch
/// every child concurrently on its own fork of the state and merge the
/// forks after all children finish. Steps that fail become
/// [`Outcome::Failed`]; they never abort the run and never raise `halt`.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    event_buffer: usize,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of the event channel between the run and its consumer.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Start a run. Events are produced as the consumer pulls them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self, root: impl Into<Arc<StepGroup>>, initial: SharedState) -> Run {
        let root = root.into();
        let run_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.event_buffer);

        let span = tracing::info_span!("pipeline", run_id = %run_id, root = %root.id());
        let handle = tokio::spawn(
            async move {
                let start = Instant::now();
                let mut state = initial;
                let driver = Driver { tx };
                info!(steps = root.step_count(), "Pipeline run started");
                let outcome = driver.run_group(&root, &mut state).await;
                info!(
                    completed = outcome.is_completed(),
                    halted = state.is_halted(),
                    "Pipeline run finished"
                );
                (state, start.elapsed())
            }
            .instrument(span),
        );

        Run {
            run_id,
            rx,
            seen: Vec::new(),
            handle: Some(handle),
        }
    }

    /// Run to completion and collect the report.
    pub async fn execute(
        &self,
        root: impl Into<Arc<StepGroup>>,
        initial: SharedState,
    ) -> Result<RunReport> {
        self.run(root, initial).finish().await
    }
}

/// A single in-flight run: a finite stream of [`RunEvent`]s.
///
/// Not restartable. Dropping an unfinished run aborts it.
pub struct Run {
    run_id: String,
    rx: mpsc::Receiver<RunEvent>,
    seen: Vec<RunEvent>,
    handle: Option<JoinHandle<(SharedState, Duration)>>,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the next event. `None` once the run is over.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        let event = self.rx.recv().await?;
        self.seen.push(event.clone());
        Some(event)
    }

    /// Drain remaining events and return the report with the final state.
    pub async fn finish(mut self) -> Result<RunReport> {
        while self.next_event().await.is_some() {}

        let handle = self
            .handle
            .take()
            .ok_or_else(|| TandemError::RunAborted("run already finished".into()))?;
        let (state, elapsed) = handle
            .await
            .map_err(|e| TandemError::RunAborted(e.to_string()))?;

        Ok(RunReport {
            run_id: std::mem::take(&mut self.run_id),
            events: std::mem::take(&mut self.seen),
            state,
            total_elapsed_ms: elapsed.as_millis() as u64,
        })
    }
}

impl Stream for Run {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.seen.push(event.clone());
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Driver {
    tx: mpsc::Sender<RunEvent>,
}

impl Driver {
    async fn emit(&self, node_id: &str, kind: NodeKind, outcome: &Outcome, started: Instant) {
        let event = RunEvent {
            node_id: node_id.to_string(),
            kind,
            outcome: outcome.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            at: Utc::now(),
        };
        // Consumer may have stopped listening; the run still completes.
        let _ = self.tx.send(event).await;
    }

    fn run_node<'a>(&'a self, node: &'a Node, state: &'a mut SharedState) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            match node {
                Node::Step(step) => self.run_step(step, state).await,
                Node::Group(group) => self.run_group(group, state).await,
            }
        })
    }

    async fn run_group(&self, group: &StepGroup, state: &mut SharedState) -> Outcome {
        let start = Instant::now();
        let children = group.children();

        let outcomes = match group.mode() {
            GroupMode::Sequential => {
                let mut outcomes = Vec::with_capacity(children.len());
                for child in children {
                    let outcome = if state.is_halted() {
                        self.skip_node(child).await
                    } else {
                        self.run_node(child, state).await
                    };
                    outcomes.push(outcome);
                }
                outcomes
            }
            GroupMode::Parallel if state.is_halted() => {
                let mut outcomes = Vec::with_capacity(children.len());
                for child in children {
                    outcomes.push(self.skip_node(child).await);
                }
                outcomes
            }
            GroupMode::Parallel => {
                let mut forks: Vec<SharedState> = children.iter().map(|_| state.fork()).collect();
                let outcomes = join_all(
                    children
                        .iter()
                        .zip(forks.iter_mut())
                        .map(|(child, fork)| self.run_node(child, fork)),
                )
                .await;
                for fork in forks {
                    state.absorb(fork);
                }
                outcomes
            }
        };

        let outcome = aggregate(children, &outcomes);
        info!(
            group = %group.id(),
            mode = ?group.mode(),
            completed = outcome.is_completed(),
            skipped = outcome.is_skipped(),
            failed = outcome.is_failed(),
            "Group finished"
        );
        self.emit(group.id(), group_kind(group), &outcome, start).await;
        outcome
    }

    /// Mark a subtree skipped without invoking any work function.
    fn skip_node<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let start = Instant::now();
            match node {
                Node::Step(step) => {
                    debug!(step = %step.id(), "Step skipped: pipeline halted");
                    self.emit(step.id(), NodeKind::Step, &Outcome::Skipped, start).await;
                }
                Node::Group(group) => {
                    for child in group.children() {
                        self.skip_node(child).await;
                    }
                    self.emit(group.id(), group_kind(group), &Outcome::Skipped, start)
                        .await;
                }
            }
            Outcome::Skipped
        })
    }

    async fn run_step(&self, step: &Step, state: &mut SharedState) -> Outcome {
        let start = Instant::now();

        if state.is_halted() {
            debug!(step = %step.id(), "Step skipped: pipeline halted");
            self.emit(step.id(), NodeKind::Step, &Outcome::Skipped, start).await;
            return Outcome::Skipped;
        }
        if step.should_skip(state) {
            debug!(step = %step.id(), "Step skipped by predicate");
            self.emit(step.id(), NodeKind::Step, &Outcome::Skipped, start).await;
            return Outcome::Skipped;
        }

        debug!(step = %step.id(), "Executing step");
        let ctx = step.context(state);
        let halt = ctx.halt_handle();

        let outcome = match step.invoke(ctx).await {
            Ok(value) => {
                if let Some(key) = step.output_key() {
                    state.set(key, value.clone());
                }
                Outcome::Completed { value }
            }
            Err(e) => {
                warn!(step = %step.id(), error = %e, "Step failed");
                Outcome::Failed {
                    cause: e.to_string(),
                }
            }
        };

        if halt.load(Ordering::SeqCst) {
            info!(step = %step.id(), "Step requested halt; remaining steps will be skipped");
            state.halt();
        }

        debug!(
            step = %step.id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Step execution complete"
        );
        self.emit(step.id(), NodeKind::Step, &outcome, start).await;
        outcome
    }
}

fn group_kind(group: &StepGroup) -> NodeKind {
    match group.mode() {
        GroupMode::Sequential => NodeKind::Sequential,
        GroupMode::Parallel => NodeKind::Parallel,
    }
}

/// Failed if any child failed, skipped if every child was skipped,
/// otherwise completed. An empty group is completed.
fn aggregate(children: &[Node], outcomes: &[Outcome]) -> Outcome {
    let failures: Vec<String> = children
        .iter()
        .zip(outcomes)
        .filter_map(|(child, outcome)| {
            outcome
                .cause()
                .map(|cause| format!("{}: {}", child.id(), cause))
        })
        .collect();

    if !failures.is_empty() {
        Outcome::Failed {
            cause: failures.join("; "),
        }
    } else if !outcomes.is_empty() && outcomes.iter().all(Outcome::is_skipped) {
        Outcome::Skipped
    } else {
        Outcome::Completed { value: Value::Null }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn constant(id: &str, key: &str, value: Value) -> Node {
        Step::from_fn(id, move |_| Ok(value.clone()))
            .with_output(key)
            .into()
    }

    #[test]
    fn test_aggregate() {
        let children = vec![
            constant("a", "x", json!(1)),
            constant("b", "y", json!(2)),
        ];
        let ok = aggregate(&children, &[Outcome::completed(json!(1)), Outcome::Skipped]);
        assert!(ok.is_completed());

        let skipped = aggregate(&children, &[Outcome::Skipped, Outcome::Skipped]);
        assert!(skipped.is_skipped());

        let failed = aggregate(
            &children,
            &[Outcome::failed("bad input"), Outcome::failed("timeout")],
        );
        assert_eq!(failed.cause(), Some("a: bad input; b: timeout"));

        assert!(aggregate(&[], &[]).is_completed());
    }

    #[tokio::test]
    async fn test_sequential_sees_prior_writes() {
        let root = StepGroup::sequential(
            "root",
            vec![
                constant("a", "x", json!(2)),
                Step::from_fn("double", |ctx| {
                    let x = ctx.require("x")?.as_i64().unwrap_or_default();
                    Ok(json!(x * 2))
                })
                .with_inputs(["x"])
                .with_output("y")
                .into(),
            ],
        )
        .unwrap();

        let report = Orchestrator::new()
            .execute(root, SharedState::new())
            .await
            .unwrap();
        assert_eq!(report.state.get("y"), Some(&json!(4)));
        assert!(report.succeeded());
        assert!(report.root_outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_failed_step_does_not_halt() {
        let root = StepGroup::sequential(
            "root",
            vec![
                Step::from_fn("fails", |ctx| Err(TandemError::step(ctx.step_id(), "no route")))
                    .with_output("x")
                    .into(),
                constant("after", "y", json!("ran")),
            ],
        )
        .unwrap();

        let report = Orchestrator::new()
            .execute(root, SharedState::new())
            .await
            .unwrap();
        assert!(report.outcome_of("fails").unwrap().is_failed());
        assert!(report.outcome_of("after").unwrap().is_completed());
        assert!(!report.state.contains("x"));
        assert!(!report.state.is_halted());
        assert!(report.root_outcome().unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_initially_halted_run_skips_everything() {
        let root = StepGroup::sequential(
            "root",
            vec![
                constant("a", "x", json!(1)),
                StepGroup::parallel("fan", vec![constant("b", "y", json!(2))])
                    .unwrap()
                    .into(),
            ],
        )
        .unwrap();

        let mut initial = SharedState::new();
        initial.halt();
        let report = Orchestrator::new().execute(root, initial).await.unwrap();

        assert!(report.step_outcomes().iter().all(|o| o.is_skipped()));
        assert_eq!(report.outcome_of("fan"), Some(&Outcome::Skipped));
        assert_eq!(report.root_outcome(), Some(&Outcome::Skipped));
        assert_eq!(report.state.len(), 1);
    }

    #[tokio::test]
    async fn test_run_streams_events() {
        let root = StepGroup::sequential(
            "root",
            vec![constant("a", "x", json!(1)), constant("b", "y", json!(2))],
        )
        .unwrap();

        let mut run = Orchestrator::new()
            .with_event_buffer(1)
            .run(root, SharedState::new());
        let first = run.next().await.unwrap();
        assert_eq!(first.node_id, "a");
        assert_eq!(first.kind, NodeKind::Step);

        let report = run.finish().await.unwrap();
        let ids: Vec<&str> = report.events.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "root"]);
    }

    #[tokio::test]
    async fn test_skip_predicate_is_not_a_failure() {
        let root = StepGroup::sequential(
            "root",
            vec![Step::from_fn("optional", |_| Ok(json!(1)))
                .with_output("x")
                .skip_if(|s| !s.contains("enabled"))
                .into()],
        )
        .unwrap();

        let report = Orchestrator::new()
            .execute(root, SharedState::new())
            .await
            .unwrap();
        assert_eq!(report.outcome_of("optional"), Some(&Outcome::Skipped));
        assert!(report.succeeded());
    }
}
