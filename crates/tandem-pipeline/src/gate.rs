//! Gating steps: the policy side of the short-circuit protocol.
//!
//! A failed step never stops a pipeline by itself. Stopping is a decision
//! made by a gate, which inspects state and raises `halt` through its
//! [`StepContext`](crate::StepContext).

use serde_json::Value;
use tracing::info;

use crate::step::Step;

/// A step that raises `halt` when `predicate` holds for the value under `key`.
///
/// The step completes with `true` when it halted the pipeline, `false` otherwise.
pub fn halt_when<F>(id: impl Into<String>, key: impl Into<String>, predicate: F) -> Step
where
    F: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
{
    let key = key.into();
    let input = key.clone();
    Step::from_fn(id, move |ctx| {
        let blocked = predicate(ctx.get(&key));
        if blocked {
            info!(step = %ctx.step_id(), key = %key, "Gate closed, halting pipeline");
            ctx.request_halt();
        }
        Ok(Value::Bool(blocked))
    })
    .with_inputs([input])
}

/// A step that halts the pipeline when the string under `key` contains
/// `keyword`, compared case-insensitively.
pub fn keyword_gate(id: impl Into<String>, key: impl Into<String>, keyword: &str) -> Step {
    let keyword = keyword.to_uppercase();
    halt_when(id, key, move |value| {
        value
            .and_then(Value::as_str)
            .is_some_and(|text| text.to_uppercase().contains(&keyword))
    })
}
