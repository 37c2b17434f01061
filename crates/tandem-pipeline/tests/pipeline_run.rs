use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use tandem_pipeline::{
    keyword_gate, NodeKind, Orchestrator, Outcome, SharedState, Step, StepGroup, HALT_KEY,
};
use tandem_test_utils::{sleepy_step, SpyCounter};

fn double(id: &str, input: &str, output: &str) -> Step {
    let input_key = input.to_string();
    Step::from_fn(id, move |ctx| {
        let x = ctx.require(&input_key)?.as_i64().unwrap_or_default();
        Ok(json!(x * 2))
    })
    .with_inputs([input])
    .with_output(output)
}

fn add_one(id: &str, input: &str, output: &str) -> Step {
    let input_key = input.to_string();
    Step::from_fn(id, move |ctx| {
        let x = ctx.require(&input_key)?.as_i64().unwrap_or_default();
        Ok(json!(x + 1))
    })
    .with_inputs([input])
    .with_output(output)
}

fn sum(id: &str) -> Step {
    Step::from_fn(id, |ctx| {
        let y = ctx.require("y")?.as_i64().unwrap_or_default();
        let z = ctx.require("z")?.as_i64().unwrap_or_default();
        Ok(json!(y + z))
    })
    .with_inputs(["y", "z"])
}

fn fan_out_pipeline(first: Step) -> StepGroup {
    let fan_out = StepGroup::parallel(
        "fan_out",
        vec![double("b", "x", "y").into(), add_one("c", "x", "z").into()],
    )
    .unwrap();
    StepGroup::sequential("root", vec![first.into(), fan_out.into(), sum("d").into()]).unwrap()
}

fn step_status(outcomes: &[&Outcome]) -> Vec<&'static str> {
    outcomes
        .iter()
        .map(|o| match o {
            Outcome::Completed { .. } => "completed",
            Outcome::Skipped => "skipped",
            Outcome::Failed { .. } => "failed",
        })
        .collect()
}

#[tokio::test]
async fn test_sequential_parallel_sequential_completes() {
    let a = Step::from_fn("a", |_| Ok(json!(1))).with_output("x");
    let report = Orchestrator::new()
        .execute(fan_out_pipeline(a), SharedState::new())
        .await
        .unwrap();

    let ids: Vec<&str> = report.step_events().map(|e| e.node_id.as_str()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], "a");
    assert_eq!(ids[3], "d");
    assert_eq!(
        step_status(&report.step_outcomes()),
        vec!["completed"; 4]
    );

    let keys: Vec<&str> = report.state.keys().collect();
    assert_eq!(keys, vec!["x", "y", "z"]);
    assert_eq!(report.state.get("x"), Some(&json!(1)));
    assert_eq!(report.state.get("y"), Some(&json!(2)));
    assert_eq!(report.state.get("z"), Some(&json!(2)));
    assert_eq!(report.outcome_of("d").and_then(Outcome::value), Some(&json!(4)));
    assert!(report.succeeded());
}

#[tokio::test]
async fn test_halt_in_first_step_skips_the_rest() {
    let a = Step::from_fn("a", |ctx| {
        ctx.request_halt();
        Ok(json!(1))
    })
    .with_output("x");
    let report = Orchestrator::new()
        .execute(fan_out_pipeline(a), SharedState::new())
        .await
        .unwrap();

    assert_eq!(
        step_status(&report.step_outcomes()),
        vec!["completed", "skipped", "skipped", "skipped"]
    );
    let keys: Vec<&str> = report.state.keys().collect();
    assert_eq!(keys, vec!["x", HALT_KEY]);
    assert!(report.state.is_halted());
    assert_eq!(report.outcome_of("fan_out"), Some(&Outcome::Skipped));
}

#[tokio::test]
async fn test_no_step_runs_after_halt() {
    let spy = SpyCounter::new();
    let inner = StepGroup::parallel(
        "inner",
        vec![
            spy.step("p1", json!("p1")).with_output("p1").into(),
            spy.step("p2", json!("p2")).with_output("p2").into(),
        ],
    )
    .unwrap();
    let root = StepGroup::sequential(
        "root",
        vec![
            keyword_gate("gate", "query", "BLOCK").into(),
            inner.into(),
            spy.step("tail", json!("tail")).into(),
        ],
    )
    .unwrap();
    let state: SharedState = [("query", json!("please block this"))].into_iter().collect();

    let report = Orchestrator::new().execute(root, state).await.unwrap();

    assert_eq!(spy.count(), 0);
    assert_eq!(report.outcome_of("gate").and_then(Outcome::value), Some(&json!(true)));
    assert_eq!(report.step_outcomes().iter().filter(|o| o.is_skipped()).count(), 3);
}

#[tokio::test]
async fn test_failure_does_not_halt() {
    let spy = SpyCounter::new();
    let root = StepGroup::sequential(
        "root",
        vec![
            spy.failing_step("broken", "upstream unavailable").into(),
            spy.step("after", json!("ran")).with_output("after").into(),
        ],
    )
    .unwrap();

    let report = Orchestrator::new()
        .execute(root, SharedState::new())
        .await
        .unwrap();

    assert_eq!(spy.count(), 2);
    assert_eq!(
        step_status(&report.step_outcomes()),
        vec!["failed", "completed"]
    );
    assert!(report.outcome_of("root").is_some_and(Outcome::is_failed));
    assert!(!report.state.is_halted());
    assert_eq!(report.state.get("after"), Some(&json!("ran")));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_writes_merge_in_declaration_order() {
    // The slow branch finishes last but was declared first.
    let root = StepGroup::sequential(
        "root",
        vec![StepGroup::parallel(
            "fan",
            vec![
                sleepy_step("slow", Duration::from_secs(3), json!("s"))
                    .with_output("slow")
                    .into(),
                sleepy_step("fast", Duration::from_millis(10), json!("f"))
                    .with_output("fast")
                    .into(),
            ],
        )
        .unwrap()
        .into()],
    )
    .unwrap();

    let report = Orchestrator::new()
        .execute(root, SharedState::new())
        .await
        .unwrap();

    let keys: Vec<&str> = report.state.keys().collect();
    assert_eq!(keys, vec!["slow", "fast"]);
    let ids: Vec<&str> = report.step_events().map(|e| e.node_id.as_str()).collect();
    assert_eq!(ids, vec!["fast", "slow"]);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_halt_lets_running_siblings_finish() {
    let spy = SpyCounter::new();
    let root = StepGroup::sequential(
        "root",
        vec![
            StepGroup::parallel(
                "fan",
                vec![
                    spy.halting_step("stopper", json!("stop")).with_output("s").into(),
                    sleepy_step("long", Duration::from_secs(1), json!("done"))
                        .with_output("long")
                        .into(),
                ],
            )
            .unwrap()
            .into(),
            spy.step("after", Value::Null).into(),
        ],
    )
    .unwrap();

    let report = Orchestrator::new()
        .execute(root, SharedState::new())
        .await
        .unwrap();

    assert_eq!(spy.count(), 1);
    assert_eq!(report.state.get("long"), Some(&json!("done")));
    assert!(report.state.is_halted());
    assert_eq!(report.outcome_of("after"), Some(&Outcome::Skipped));
}

#[tokio::test]
async fn test_run_streams_events_in_completion_order() {
    let a = Step::from_fn("a", |_| Ok(json!(1))).with_output("x");
    let run = Orchestrator::new().run(fan_out_pipeline(a), SharedState::new());
    let events: Vec<_> = run.collect().await;

    assert_eq!(events.first().map(|e| e.node_id.as_str()), Some("a"));
    let last = events.last().unwrap();
    assert_eq!(last.node_id, "root");
    assert_eq!(last.kind, NodeKind::Sequential);
    let fan_out = events.iter().position(|e| e.node_id == "fan_out").unwrap();
    let d = events.iter().position(|e| e.node_id == "d").unwrap();
    assert!(fan_out < d);
}

#[tokio::test]
async fn test_parallel_group_is_deterministic_across_runs() {
    let orchestrator = Orchestrator::new();
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let a = Step::from_fn("a", |_| Ok(json!(21))).with_output("x");
        let report = orchestrator
            .execute(fan_out_pipeline(a), SharedState::new())
            .await
            .unwrap();
        snapshots.push(report.state.snapshot());
    }
    assert_eq!(snapshots[0], snapshots[1]);
}
