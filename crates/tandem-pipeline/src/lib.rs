//! Step orchestration: sequential and parallel pipelines over shared state.
//!
//! A pipeline is a tree of [`StepGroup`]s whose leaves are [`Step`]s. The
//! [`Orchestrator`] walks the tree against one [`SharedState`], checking the
//! reserved `halt` flag before every step. Once a step or gate raises the
//! flag, everything that has not started yet is reported as
//! [`Outcome::Skipped`] instead of being run.

pub mod gate;
pub mod group;
pub mod orchestrator;
pub mod outcome;
pub mod state;
pub mod step;

pub use gate::{halt_when, keyword_gate};
pub use group::{GroupMode, Node, StepGroup};
pub use orchestrator::{Orchestrator, Run};
pub use outcome::{NodeKind, Outcome, RunEvent, RunReport};
pub use state::{SharedState, StateSnapshot, HALT_KEY};
pub use step::{SkipPredicate, Step, StepContext, WorkFn};
