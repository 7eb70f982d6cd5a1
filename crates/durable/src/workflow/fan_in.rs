//! Fan-out/fan-in bookkeeping for workflows

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Collects results of parallel branches and returns them in submission order
///
/// Branches may complete in any order; [`FanIn::results`] always lists them
/// in the order they were added, so a workflow that fans out N activities
/// and joins them behaves the same on every replay.
///
/// # Example
///
/// ```
/// use waypoint_durable::workflow::FanIn;
/// use serde_json::json;
///
/// let mut join = FanIn::new();
/// join.add("a");
/// join.add("b");
///
/// join.record("b", json!(2));
/// join.record("a", json!(1));
///
/// assert_eq!(join.results(), Some(vec![json!(1), json!(2)]));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FanIn {
    order: Vec<String>,
    results: HashMap<String, Value>,
}

impl FanIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a branch; returns the id for chaining into a command
    pub fn add(&mut self, id: impl Into<String>) -> String {
        let id = id.into();
        if !self.order.contains(&id) {
            self.order.push(id.clone());
        }
        id
    }

    /// Whether `id` is one of this join's branches
    pub fn contains(&self, id: &str) -> bool {
        self.order.iter().any(|o| o == id)
    }

    /// Record a branch result
    ///
    /// Returns false for unknown ids and for branches that already reported.
    pub fn record(&mut self, id: &str, result: Value) -> bool {
        if !self.contains(id) || self.results.contains_key(id) {
            return false;
        }
        self.results.insert(id.to_string(), result);
        true
    }

    /// Number of branches still outstanding
    pub fn remaining(&self) -> usize {
        self.order.len() - self.results.len()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// All results in submission order, once every branch has reported
    pub fn results(&self) -> Option<Vec<Value>> {
        if !self.is_complete() {
            return None;
        }
        self.order
            .iter()
            .map(|id| self.results.get(id).cloned())
            .collect()
    }
}
