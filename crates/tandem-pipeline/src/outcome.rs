use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::SharedState;

/// Result of one step or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed { value: Value },
    Skipped,
    Failed { cause: String },
}

impl Outcome {
    pub fn completed(value: Value) -> Self {
        Outcome::Completed { value }
    }

    pub fn failed(cause: impl Into<String>) -> Self {
        Outcome::Failed {
            cause: cause.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Completed { value } => Some(value),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            Outcome::Failed { cause } => Some(cause),
            _ => None,
        }
    }
}

/// Which kind of tree node produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    Sequential,
    Parallel,
}

/// One entry in a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub node_id: String,
    pub kind: NodeKind,
    pub outcome: Outcome,
    /// Execution time in milliseconds.
    pub elapsed_ms: u64,
    pub at: DateTime<Utc>,
}

/// Result of an entire run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// All events, in emission order. The root group's event is last.
    pub events: Vec<RunEvent>,
    /// Final shared state.
    pub state: SharedState,
    pub total_elapsed_ms: u64,
}

impl RunReport {
    /// Outcome of the root group.
    pub fn root_outcome(&self) -> Option<&Outcome> {
        self.events.last().map(|e| &e.outcome)
    }

    /// Leaf step events, in emission order.
    pub fn step_events(&self) -> impl Iterator<Item = &RunEvent> {
        self.events.iter().filter(|e| e.kind == NodeKind::Step)
    }

    /// Leaf step outcomes, in emission order.
    pub fn step_outcomes(&self) -> Vec<&Outcome> {
        self.step_events().map(|e| &e.outcome).collect()
    }

    /// Outcome of the node with the given id.
    pub fn outcome_of(&self, node_id: &str) -> Option<&Outcome> {
        self.events
            .iter()
            .find(|e| e.node_id == node_id)
            .map(|e| &e.outcome)
    }

    /// Whether no step failed.
    pub fn succeeded(&self) -> bool {
        !self.events.iter().any(|e| e.outcome.is_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, kind: NodeKind, outcome: Outcome) -> RunEvent {
        RunEvent {
            node_id: id.into(),
            kind,
            outcome,
            elapsed_ms: 1,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_outcome_accessors() {
        let done = Outcome::completed(json!(3));
        assert!(done.is_completed());
        assert_eq!(done.value(), Some(&json!(3)));

        let failed = Outcome::failed("smtp refused");
        assert!(failed.is_failed());
        assert_eq!(failed.cause(), Some("smtp refused"));
        assert!(Outcome::Skipped.is_skipped());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(Outcome::failed("x")).unwrap();
        assert_eq!(json, json!({"status": "failed", "cause": "x"}));
        let json = serde_json::to_value(Outcome::Skipped).unwrap();
        assert_eq!(json, json!({"status": "skipped"}));
    }

    #[test]
    fn test_report_queries() {
        let report = RunReport {
            run_id: "r1".into(),
            events: vec![
                event("a", NodeKind::Step, Outcome::completed(json!(1))),
                event("b", NodeKind::Step, Outcome::failed("nope")),
                event("root", NodeKind::Sequential, Outcome::failed("b: nope")),
            ],
            state: SharedState::new(),
            total_elapsed_ms: 2,
        };

        assert_eq!(report.step_outcomes().len(), 2);
        assert_eq!(report.outcome_of("a"), Some(&Outcome::completed(json!(1))));
        assert!(report.root_outcome().unwrap().is_failed());
        assert!(!report.succeeded());
    }
}
