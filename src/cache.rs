//! Process- and run-scoped key/value store.
//!
//! The cache is the only state shared between loggers, dispatchers and
//! worker processes: recursion guards, split descriptors, dataset hashes
//! and cross-logger rendezvous points all live here. The run scope is
//! keyed by the run identity observed at write time and dropped when that
//! run ends; the process scope survives run boundaries.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serializable snapshot of a single run scope, used to transport cache
/// state to and from worker processes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: BTreeMap<String, Value>,
}

/// Two-scope cache: one process-wide store plus one store per active run.
#[derive(Debug, Default)]
pub struct TrackerCache {
    process: DashMap<String, Value>,
    runs: DashMap<String, DashMap<String, Value>>,
}

impl TrackerCache {
    pub fn new() -> Self {
        Self::default()
    }

    // --- process scope ---

    pub fn add(&self, key: &str, value: Value) {
        self.process.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.process.get(key).map(|entry| entry.value().clone())
    }

    pub fn pop(&self, key: &str) -> Option<Value> {
        self.process.remove(key).map(|(_, value)| value)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.process.contains_key(key)
    }

    pub fn clear(&self) {
        self.process.clear();
    }

    // --- run scope ---

    pub fn run_add(&self, run_id: &str, key: &str, value: Value) {
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn run_get(&self, run_id: &str, key: &str) -> Option<Value> {
        self.runs
            .get(run_id)
            .and_then(|scope| scope.get(key).map(|entry| entry.value().clone()))
    }

    pub fn run_pop(&self, run_id: &str, key: &str) -> Option<Value> {
        self.runs
            .get(run_id)
            .and_then(|scope| scope.remove(key).map(|(_, value)| value))
    }

    pub fn run_exists(&self, run_id: &str, key: &str) -> bool {
        self.runs
            .get(run_id)
            .map(|scope| scope.contains_key(key))
            .unwrap_or(false)
    }

    /// Drop the entire scope for `run_id`. Total and infallible: callable
    /// after the backend has already closed the run.
    pub fn run_clear(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    /// Union `snapshot` into the scope of `run_id`; incoming entries win.
    pub fn merge(&self, run_id: &str, snapshot: &CacheSnapshot) {
        let scope = self.runs.entry(run_id.to_string()).or_default();
        for (key, value) in &snapshot.entries {
            scope.insert(key.clone(), value.clone());
        }
    }

    /// Serializable copy of the scope for `run_id`.
    pub fn snapshot(&self, run_id: &str) -> CacheSnapshot {
        let entries = self
            .runs
            .get(run_id)
            .map(|scope| {
                scope
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        CacheSnapshot { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn process_scope_survives_run_clear() {
        let cache = TrackerCache::new();
        cache.add("model_hash", json!("abc"));
        cache.run_add("run-1", "split", json!(3));

        cache.run_clear("run-1");

        assert!(cache.exists("model_hash"));
        assert!(!cache.run_exists("run-1", "split"));
    }

    #[test]
    fn run_scopes_are_isolated() {
        let cache = TrackerCache::new();
        cache.run_add("run-1", "seen", json!(true));
        assert!(!cache.run_exists("run-2", "seen"));
        assert_eq!(cache.run_get("run-1", "seen"), Some(json!(true)));
    }

    #[test]
    fn pop_removes_the_entry() {
        let cache = TrackerCache::new();
        cache.run_add("run-1", "once", json!(1));
        assert_eq!(cache.run_pop("run-1", "once"), Some(json!(1)));
        assert_eq!(cache.run_pop("run-1", "once"), None);
    }

    #[test]
    fn merge_unions_and_overwrites() {
        let cache = TrackerCache::new();
        cache.run_add("run-1", "a", json!(1));
        cache.run_add("run-1", "b", json!(2));

        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), json!(20));
        entries.insert("c".to_string(), json!(30));
        cache.merge("run-1", &CacheSnapshot { entries });

        assert_eq!(cache.run_get("run-1", "a"), Some(json!(1)));
        assert_eq!(cache.run_get("run-1", "b"), Some(json!(20)));
        assert_eq!(cache.run_get("run-1", "c"), Some(json!(30)));
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let cache = TrackerCache::new();
        cache.run_add("run-1", "seen/0", json!(true));
        cache.run_add("run-1", "seen/1", json!(true));

        let snapshot = cache.snapshot("run-1");
        let raw = serde_json::to_string(&snapshot).expect("serialize snapshot");
        let restored: CacheSnapshot = serde_json::from_str(&raw).expect("parse snapshot");
        assert_eq!(snapshot, restored);
        assert_eq!(restored.entries.len(), 2);
    }

    #[test]
    fn clear_on_missing_run_is_a_noop() {
        let cache = TrackerCache::new();
        cache.run_clear("never-started");
    }
}
