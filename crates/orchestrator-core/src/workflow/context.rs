//! The shared mutable key-value store threaded through a workflow run.
//!
//! Concurrent steps within the same parallel wave may read and write this
//! map freely; the engine guarantees no torn values or map corruption, but
//! makes no ordering promise across simultaneous writers to the same key
//! (last-writer-wins). Steps that need to share a key across concurrent
//! peers are contractually discouraged from doing so by the spec this
//! engine implements.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;

/// A concurrency-safe `String -> Value` map.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    values: DashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// A point-in-time snapshot of every key/value pair, for embedding into
    /// a `WorkflowResult`.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!(1));
        assert_eq!(ctx.get("a"), Some(json!(1)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn last_write_wins_for_concurrent_writers() {
        let ctx = WorkflowContext::new();
        ctx.set("shared", json!("first"));
        ctx.set("shared", json!("second"));
        assert_eq!(ctx.get("shared"), Some(json!("second")));
    }

    #[test]
    fn snapshot_reflects_all_keys() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!(1));
        ctx.set("b", json!(2));
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("a"), Some(&json!(1)));
    }

    #[test]
    fn remove_drops_the_key() {
        let ctx = WorkflowContext::new();
        ctx.set("a", json!(1));
        assert_eq!(ctx.remove("a"), Some(json!(1)));
        assert!(!ctx.contains_key("a"));
    }
}
