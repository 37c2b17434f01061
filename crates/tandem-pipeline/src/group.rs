use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tandem_core::error::{Result, TandemError};

use crate::state::HALT_KEY;
use crate::step::Step;

/// How a group schedules its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// In declared order; each child sees the effects of all prior children.
    Sequential,
    /// Concurrently; results merged before the group completes.
    Parallel,
}

/// A child of a [`StepGroup`].
#[derive(Debug, Clone)]
pub enum Node {
    Step(Step),
    Group(StepGroup),
}

impl From<Step> for Node {
    fn from(step: Step) -> Self {
        Node::Step(step)
    }
}

impl From<StepGroup> for Node {
    fn from(group: StepGroup) -> Self {
        Node::Group(group)
    }
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Step(s) => s.id(),
            Node::Group(g) => g.id(),
        }
    }

    /// Every output key declared anywhere in this subtree.
    pub fn output_keys(&self) -> Vec<&str> {
        match self {
            Node::Step(s) => s.output_key().into_iter().collect(),
            Node::Group(g) => g.output_keys(),
        }
    }
}

/// Sequential or parallel composite of steps and nested groups.
///
/// Immutable once built. Construction rejects parallel siblings whose
/// subtrees declare the same output key, and steps that declare the
/// reserved `halt` key as their output.
#[derive(Debug, Clone)]
pub struct StepGroup {
    id: String,
    mode: GroupMode,
    children: Vec<Node>,
}

impl StepGroup {
    /// Build a sequential group.
    pub fn sequential(id: impl Into<String>, children: Vec<Node>) -> Result<Self> {
        Self::build(id.into(), GroupMode::Sequential, children)
    }

    /// Build a parallel group.
    pub fn parallel(id: impl Into<String>, children: Vec<Node>) -> Result<Self> {
        Self::build(id.into(), GroupMode::Parallel, children)
    }

    fn build(id: String, mode: GroupMode, children: Vec<Node>) -> Result<Self> {
        for child in &children {
            if let Node::Step(step) = child {
                if step.declares_halt() {
                    return Err(TandemError::InvalidPipeline(format!(
                        "step '{}' in group '{}' declares reserved output key '{}'",
                        step.id(),
                        id,
                        HALT_KEY
                    )));
                }
            }
        }

        if mode == GroupMode::Parallel {
            // A child may rewrite its own keys; only writes across siblings clash.
            let mut owners: HashMap<&str, usize> = HashMap::new();
            for (index, child) in children.iter().enumerate() {
                for key in child.output_keys() {
                    match owners.insert(key, index) {
                        Some(other) if other != index => {
                            return Err(TandemError::InvalidPipeline(format!(
                                "parallel group '{}': children '{}' and '{}' both write '{}'",
                                id,
                                children[other].id(),
                                child.id(),
                                key
                            )));
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(Self { id, mode, children })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> GroupMode {
        self.mode
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Every output key declared in this group, in tree order.
    pub fn output_keys(&self) -> Vec<&str> {
        self.children.iter().flat_map(Node::output_keys).collect()
    }

    /// Number of leaf steps in this group, counting nested groups.
    pub fn step_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                Node::Step(_) => 1,
                Node::Group(g) => g.step_count(),
            })
            .sum()
    }
}
