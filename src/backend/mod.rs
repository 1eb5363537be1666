//! Backend facade: the minimal experiment-store surface the core consumes.
//!
//! The core never persists anything itself; runs, params, metrics, tags and
//! artifacts all flow through [`TrackingBackend`]. Implementations must be
//! idempotent on repeated `end_run` and tolerate `end_run` without a start.

mod fs;
mod memory;

pub use fs::FileStoreBackend;
pub use memory::{InMemoryBackend, RunSnapshot};

use std::path::Path;
use std::sync::Arc;

use trackpads_errors::TrackResult;

/// Serialization format for in-memory artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFormat {
    Text,
    Json,
}

impl WriteFormat {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "text" => Some(WriteFormat::Text),
            "json" => Some(WriteFormat::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            WriteFormat::Text => "txt",
            WriteFormat::Json => "json",
        }
    }
}

/// Identity of a run handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
}

/// Experiment-store surface consumed by the tracking core.
pub trait TrackingBackend: Send + Sync {
    /// Connection string of the store (`file:…`, `mem:`).
    fn uri(&self) -> &str;

    /// Start a run in the named experiment. With `nested`, the new run is
    /// stacked on the currently active one and the parent becomes active
    /// again once this run ends.
    fn start_run(&self, experiment: &str, nested: bool) -> TrackResult<RunInfo>;

    /// Re-enter an existing run (worker processes attach this way).
    fn resume_run(&self, run_id: &str) -> TrackResult<RunInfo>;

    /// End the innermost active run. Idempotent; a second call (or a call
    /// without an active run) is a no-op.
    fn end_run(&self) -> TrackResult<()>;

    fn active_run(&self) -> Option<RunInfo>;

    fn log_param(&self, key: &str, value: &str) -> TrackResult<()>;

    fn log_metric(&self, key: &str, value: f64, step: Option<i64>) -> TrackResult<()>;

    fn set_tag(&self, key: &str, value: &str) -> TrackResult<()>;

    /// Read a tag back from any run, active or ended.
    fn get_tag(&self, run_id: &str, key: &str) -> TrackResult<Option<String>>;

    /// Attach a file already on disk to the active run.
    fn log_artifact(&self, path: &Path) -> TrackResult<()>;

    /// Attach a named blob to the active run.
    fn log_in_memory_artifact(
        &self,
        name: &str,
        bytes: &[u8],
        format: WriteFormat,
    ) -> TrackResult<()>;
}

/// Scoped acquisition of a nested run. The enclosing run is restored when
/// the guard drops, on every exit path.
pub struct IntermediateRun {
    backend: Arc<dyn TrackingBackend>,
    run: RunInfo,
    enclosing: Option<RunInfo>,
    finished: bool,
}

impl IntermediateRun {
    /// Open a nested run inside the currently active one.
    pub fn open(backend: Arc<dyn TrackingBackend>, experiment: &str) -> TrackResult<Self> {
        let enclosing = backend.active_run();
        let run = backend.start_run(experiment, true)?;
        Ok(Self {
            backend,
            run,
            enclosing,
            finished: false,
        })
    }

    pub fn run(&self) -> &RunInfo {
        &self.run
    }

    /// Close the nested run early. Equivalent to dropping the guard.
    pub fn finish(mut self) -> TrackResult<()> {
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Restore the enclosing run even if something inside ended ours
        // already; end_run on the backend is idempotent.
        if self.backend.active_run().as_ref() == Some(&self.run) {
            if let Err(err) = self.backend.end_run() {
                crate::logging::log_track_error("failed to close intermediate run", &err);
            }
        }
        debug_assert!(
            self.enclosing.is_none() || self.backend.active_run() == self.enclosing,
            "enclosing run not restored"
        );
    }
}

impl Drop for IntermediateRun {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_format_parses_known_tokens() {
        assert_eq!(WriteFormat::parse("text"), Some(WriteFormat::Text));
        assert_eq!(WriteFormat::parse("json"), Some(WriteFormat::Json));
        assert_eq!(WriteFormat::parse("yaml"), None);
        assert_eq!(WriteFormat::Json.extension(), "json");
    }

    #[test]
    fn intermediate_run_restores_enclosing_on_drop() {
        let backend = Arc::new(InMemoryBackend::new());
        let outer = backend.start_run("exp", false).expect("outer run");

        {
            let shared: Arc<dyn TrackingBackend> = backend.clone();
            let guard = IntermediateRun::open(shared, "exp").expect("nested run");
            assert_ne!(guard.run().run_id, outer.run_id);
            assert_eq!(
                backend.active_run().map(|r| r.run_id),
                Some(guard.run().run_id.clone())
            );
        }

        assert_eq!(backend.active_run().map(|r| r.run_id), Some(outer.run_id));
    }

    #[test]
    fn intermediate_run_survives_inner_end() {
        let backend = Arc::new(InMemoryBackend::new());
        let outer = backend.start_run("exp", false).expect("outer run");

        let shared: Arc<dyn TrackingBackend> = backend.clone();
        let guard = IntermediateRun::open(shared, "exp").expect("nested run");
        backend.end_run().expect("inner end");
        drop(guard);

        assert_eq!(backend.active_run().map(|r| r.run_id), Some(outer.run_id));
    }
}
