//! In-memory experiment store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use dashmap::DashMap;
use trackpads_errors::{enverr, usage, ErrorCode, TrackResult};
use uuid::Uuid;

use crate::backend::{RunInfo, TrackingBackend, WriteFormat};

#[derive(Debug, Clone, Default)]
struct RunRecord {
    experiment_id: String,
    parent_run_id: Option<String>,
    params: BTreeMap<String, String>,
    metrics: Vec<(String, f64, Option<i64>)>,
    tags: BTreeMap<String, String>,
    artifacts: BTreeMap<String, Vec<u8>>,
}

/// Read-only copy of a run for assertions and reporting.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub experiment_id: String,
    pub parent_run_id: Option<String>,
    pub params: BTreeMap<String, String>,
    pub metrics: Vec<(String, f64, Option<i64>)>,
    pub tags: BTreeMap<String, String>,
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

/// Backend keeping every run in process memory. The default for tests and
/// for worker processes attached to a parent-owned store.
pub struct InMemoryBackend {
    uri: String,
    experiments: DashMap<String, String>,
    runs: DashMap<String, RunRecord>,
    active: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            uri: "mem:".to_string(),
            experiments: DashMap::new(),
            runs: DashMap::new(),
            active: Mutex::new(Vec::new()),
        }
    }

    fn experiment_id(&self, name: &str) -> String {
        self.experiments
            .entry(name.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    fn active_run_id(&self) -> Option<String> {
        self.active.lock().expect("active run lock").last().cloned()
    }

    fn with_active<T>(
        &self,
        op: impl FnOnce(&mut RunRecord) -> T,
    ) -> TrackResult<T> {
        let run_id = self.active_run_id().ok_or_else(|| {
            usage!(ErrorCode::NoActiveRun, "no active run to log against")
        })?;
        let mut record = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| enverr!(ErrorCode::BackendUnavailable, "run '{}' vanished", run_id))?;
        Ok(op(record.value_mut()))
    }

    /// Snapshot a run by id, active or ended.
    pub fn run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.get(run_id).map(|record| RunSnapshot {
            run_id: run_id.to_string(),
            experiment_id: record.experiment_id.clone(),
            parent_run_id: record.parent_run_id.clone(),
            params: record.params.clone(),
            metrics: record.metrics.clone(),
            tags: record.tags.clone(),
            artifacts: record.artifacts.clone(),
        })
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Ids of every run the store has seen, active or ended.
    pub fn run_ids(&self) -> Vec<String> {
        self.runs.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingBackend for InMemoryBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn start_run(&self, experiment: &str, nested: bool) -> TrackResult<RunInfo> {
        let mut active = self.active.lock().expect("active run lock");
        if !nested && !active.is_empty() {
            return Err(usage!(
                ErrorCode::AlreadyActive,
                "a run is already active; use a nested run"
            ));
        }
        let experiment_id = self.experiment_id(experiment);
        let run_id = Uuid::new_v4().to_string();
        self.runs.insert(
            run_id.clone(),
            RunRecord {
                experiment_id: experiment_id.clone(),
                parent_run_id: active.last().cloned(),
                ..RunRecord::default()
            },
        );
        active.push(run_id.clone());
        Ok(RunInfo {
            run_id,
            experiment_id,
        })
    }

    fn resume_run(&self, run_id: &str) -> TrackResult<RunInfo> {
        let record = self.runs.get(run_id).ok_or_else(|| {
            usage!(ErrorCode::UnknownTarget, "run '{}' does not exist", run_id)
        })?;
        let info = RunInfo {
            run_id: run_id.to_string(),
            experiment_id: record.experiment_id.clone(),
        };
        drop(record);
        let mut active = self.active.lock().expect("active run lock");
        if active.last().map(String::as_str) != Some(run_id) {
            active.push(run_id.to_string());
        }
        Ok(info)
    }

    fn end_run(&self) -> TrackResult<()> {
        let mut active = self.active.lock().expect("active run lock");
        active.pop();
        Ok(())
    }

    fn active_run(&self) -> Option<RunInfo> {
        let run_id = self.active_run_id()?;
        let record = self.runs.get(&run_id)?;
        Some(RunInfo {
            run_id: run_id.clone(),
            experiment_id: record.experiment_id.clone(),
        })
    }

    fn log_param(&self, key: &str, value: &str) -> TrackResult<()> {
        self.with_active(|record| {
            record.params.insert(key.to_string(), value.to_string());
        })
    }

    fn log_metric(&self, key: &str, value: f64, step: Option<i64>) -> TrackResult<()> {
        self.with_active(|record| {
            record.metrics.push((key.to_string(), value, step));
        })
    }

    fn set_tag(&self, key: &str, value: &str) -> TrackResult<()> {
        self.with_active(|record| {
            record.tags.insert(key.to_string(), value.to_string());
        })
    }

    fn get_tag(&self, run_id: &str, key: &str) -> TrackResult<Option<String>> {
        Ok(self
            .runs
            .get(run_id)
            .and_then(|record| record.tags.get(key).cloned()))
    }

    fn log_artifact(&self, path: &Path) -> TrackResult<()> {
        let bytes = std::fs::read(path).map_err(|err| {
            enverr!(
                ErrorCode::Io,
                "failed to read artifact '{}'",
                path.display()
            )
            .with_source(err)
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        self.with_active(|record| {
            record.artifacts.insert(name, bytes);
        })
    }

    fn log_in_memory_artifact(
        &self,
        name: &str,
        bytes: &[u8],
        format: WriteFormat,
    ) -> TrackResult<()> {
        let key = format!("{}.{}", name, format.extension());
        self.with_active(|record| {
            record.artifacts.insert(key, bytes.to_vec());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_without_start_is_tolerated() {
        let backend = InMemoryBackend::new();
        backend.end_run().expect("no-op end");
        backend.end_run().expect("still a no-op");
        assert!(backend.active_run().is_none());
    }

    #[test]
    fn second_top_level_run_requires_nesting() {
        let backend = InMemoryBackend::new();
        backend.start_run("exp", false).expect("first run");
        let err = backend.start_run("exp", false).expect_err("second run");
        assert_eq!(err.code, ErrorCode::AlreadyActive);
        backend.start_run("exp", true).expect("nested run allowed");
    }

    #[test]
    fn nested_run_records_parent() {
        let backend = InMemoryBackend::new();
        let outer = backend.start_run("exp", false).expect("outer");
        let inner = backend.start_run("exp", true).expect("inner");
        let snapshot = backend.run(&inner.run_id).expect("inner snapshot");
        assert_eq!(snapshot.parent_run_id.as_deref(), Some(outer.run_id.as_str()));
    }

    #[test]
    fn logging_without_active_run_is_an_error() {
        let backend = InMemoryBackend::new();
        let err = backend.log_param("k", "v").expect_err("no run");
        assert_eq!(err.code, ErrorCode::NoActiveRun);
    }

    #[test]
    fn tags_survive_run_end() {
        let backend = InMemoryBackend::new();
        let run = backend.start_run("exp", false).expect("run");
        backend.set_tag("pads.config", "{}").expect("tag");
        backend.end_run().expect("end");
        assert_eq!(
            backend.get_tag(&run.run_id, "pads.config").expect("get tag"),
            Some("{}".to_string())
        );
    }

    #[test]
    fn in_memory_artifacts_are_suffixed_by_format() {
        let backend = InMemoryBackend::new();
        let run = backend.start_run("exp", false).expect("run");
        backend
            .log_in_memory_artifact("timings", b"a: 1s", WriteFormat::Text)
            .expect("artifact");
        let snapshot = backend.run(&run.run_id).expect("snapshot");
        assert!(snapshot.artifacts.contains_key("timings.txt"));
    }

    #[test]
    fn resume_reactivates_existing_run() {
        let backend = InMemoryBackend::new();
        let run = backend.start_run("exp", false).expect("run");
        backend.end_run().expect("end");
        assert!(backend.active_run().is_none());

        backend.resume_run(&run.run_id).expect("resume");
        assert_eq!(backend.active_run().map(|r| r.run_id), Some(run.run_id));
    }
}
