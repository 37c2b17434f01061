use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved key for the short-circuit flag.
pub const HALT_KEY: &str = "halt";

/// Keyed mutable store threaded through one pipeline run.
///
/// Keys are strings; values are JSON. Insertion order is preserved so that
/// snapshots and reports read in the order data was produced. Keys are never
/// removed during a run: an absent key simply reads as `None`.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    data: IndexMap<String, Value>,
    /// Keys written since this state was forked.
    changed: IndexSet<String>,
}

/// Immutable copy of a [`SharedState`], for diagnostics and events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(IndexMap<String, Value>);

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.0
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value. The last writer wins.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.changed.insert(key.clone());
        self.data.insert(key, value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    /// Whether the short-circuit flag is raised. Anything but `true` reads as clear.
    pub fn is_halted(&self) -> bool {
        matches!(self.data.get(HALT_KEY), Some(Value::Bool(true)))
    }

    /// Raise the short-circuit flag.
    pub fn halt(&mut self) {
        self.set(HALT_KEY, Value::Bool(true));
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot(self.data.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of this state with an empty change log, for one parallel branch.
    pub(crate) fn fork(&self) -> Self {
        Self {
            data: self.data.clone(),
            changed: IndexSet::new(),
        }
    }

    /// Apply the writes a forked branch made.
    ///
    /// `halt` only ever moves from clear to raised here, so a branch that
    /// never touched it cannot clear a flag raised by a sibling.
    pub(crate) fn absorb(&mut self, fork: SharedState) {
        let SharedState { mut data, changed } = fork;
        for key in changed {
            let Some(value) = data.swap_remove(&key) else {
                continue;
            };
            if key == HALT_KEY && self.is_halted() {
                continue;
            }
            self.set(key, value);
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for SharedState {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            changed: IndexSet::new(),
        }
    }
}

impl From<IndexMap<String, Value>> for SharedState {
    fn from(data: IndexMap<String, Value>) -> Self {
        Self {
            data,
            changed: IndexSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut state = SharedState::new();
        state.set_str("topic", "rust");
        state.set("count", json!(42));

        assert_eq!(state.get_str("topic"), Some("rust"));
        assert_eq!(state.get("count"), Some(&json!(42)));
        assert_eq!(state.get("missing"), None);
        assert!(!state.contains("missing"));
    }

    #[test]
    fn test_last_writer_wins() {
        let mut state = SharedState::new();
        state.set("x", json!(1));
        state.set("x", json!(2));
        assert_eq!(state.get("x"), Some(&json!(2)));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_halt_flag() {
        let mut state: SharedState = [("halt", json!("yes"))].into_iter().collect();
        assert!(!state.is_halted());
        state.halt();
        assert!(state.is_halted());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut state = SharedState::new();
        state.set("a", json!(1));
        let snap = state.snapshot();
        state.set("b", json!(2));

        assert_eq!(snap.len(), 1);
        assert_eq!(snap.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(serde_json::to_value(&snap).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut state = SharedState::new();
        state.set("z", json!(1));
        state.set("a", json!(2));
        state.set("m", json!(3));
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_fork_and_absorb() {
        let mut state: SharedState = [("x", json!(1))].into_iter().collect();

        let mut left = state.fork();
        let mut right = state.fork();
        left.set("y", json!("left"));
        right.set("z", json!("right"));

        state.absorb(left);
        state.absorb(right);

        assert_eq!(state.get("x"), Some(&json!(1)));
        assert_eq!(state.get("y"), Some(&json!("left")));
        assert_eq!(state.get("z"), Some(&json!("right")));
    }

    #[test]
    fn test_absorb_keeps_raised_halt() {
        let mut state = SharedState::new();
        let mut halting = state.fork();
        halting.halt();
        let mut clearing = state.fork();
        clearing.set(HALT_KEY, json!(false));

        state.absorb(halting);
        state.absorb(clearing);
        assert!(state.is_halted());
    }
}
