//! Worker fan-out for tracked code.
//!
//! Mirrors how the original framework rides a parallel-execution library:
//! the task payload (run id, backend URI, wrapped module names, the run
//! cache, the task reference and its argument bag) is serialized at the
//! dispatch site, deserialized in the worker, and the worker hands back
//! both the result and its accumulated cache so the parent can merge it.
//! Task functions cross the boundary by dotted target path; the worker
//! resolves them against its own registry after re-activation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trackpads_errors::{bug, enverr, ErrorCode, TrackResult};

use crate::backend::{FileStoreBackend, TrackingBackend};
use crate::cache::CacheSnapshot;
use crate::session::Tracker;
use crate::targets::CallArgs;

/// Everything a worker needs to re-activate tracking and run one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub run_id: String,
    pub backend_uri: String,
    pub config: crate::config::TrackingConfig,
    pub wrapped_modules: Vec<String>,
    pub cache: CacheSnapshot,
    pub task: String,
    pub args: CallArgs,
}

/// What a worker sends back.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerOutput {
    result: Value,
    cache: CacheSnapshot,
}

/// Run `task` over `inputs` in one worker per input. Results keep input
/// order; each worker's cache is merged into the parent's run scope after
/// the join.
pub fn parallel_map(
    tracker: &Arc<Tracker>,
    task: &str,
    inputs: Vec<CallArgs>,
) -> TrackResult<Vec<Value>> {
    let run_id = tracker.active_run_id().ok_or_else(|| {
        trackpads_errors::usage!(
            ErrorCode::NoActiveRun,
            "parallel execution requires an active run"
        )
    })?;

    // Serialize each payload at the dispatch site; only bytes cross into
    // the workers.
    let mut payloads = Vec::with_capacity(inputs.len());
    for args in inputs {
        let payload = TaskPayload {
            run_id: run_id.clone(),
            backend_uri: tracker.backend().uri().to_string(),
            config: tracker.current_config(),
            wrapped_modules: tracker.targets().module_names(),
            cache: tracker.cache().snapshot(&run_id),
            task: task.to_string(),
            args,
        };
        payloads.push(serde_json::to_vec(&payload).map_err(|err| {
            enverr!(ErrorCode::SerializationFailed, "failed to encode task payload")
                .with_source(err)
        })?);
    }

    let shared_backend = Arc::clone(tracker.backend());
    let targets = tracker.targets_arc();
    let mappings = tracker.mappings_arc();
    let functions = tracker.functions_arc();
    let important = tracker.important_modules().to_vec();

    let outputs: Vec<TrackResult<Vec<u8>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = payloads
            .into_iter()
            .map(|bytes| {
                let shared_backend = Arc::clone(&shared_backend);
                let targets = Arc::clone(&targets);
                let mappings = Arc::clone(&mappings);
                let functions = Arc::clone(&functions);
                let important = important.clone();
                scope.spawn(move || {
                    worker_main(bytes, shared_backend, targets, mappings, functions, important)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(bug!(ErrorCode::Unknown, "worker thread panicked"))
                })
            })
            .collect()
    });

    let mut results = Vec::with_capacity(outputs.len());
    for output in outputs {
        let bytes = output?;
        let output: WorkerOutput = serde_json::from_slice(&bytes).map_err(|err| {
            enverr!(ErrorCode::SerializationFailed, "failed to decode worker output")
                .with_source(err)
        })?;
        tracker.cache().merge(&run_id, &output.cache);
        results.push(output.result);
    }
    Ok(results)
}

/// Worker entry point: deserialize the payload, re-activate tracking in a
/// child session, execute the task, hand back result plus cache.
fn worker_main(
    payload: Vec<u8>,
    shared_backend: Arc<dyn TrackingBackend>,
    targets: Arc<crate::targets::TargetRegistry>,
    mappings: Arc<crate::mapping::MappingRegistry>,
    functions: Arc<crate::loggers::FunctionRegistry>,
    important: Vec<String>,
) -> TrackResult<Vec<u8>> {
    let payload: TaskPayload = serde_json::from_slice(&payload).map_err(|err| {
        enverr!(ErrorCode::SerializationFailed, "failed to decode task payload").with_source(err)
    })?;

    // A file-backed store is re-opened from its URI the way a real child
    // process would; anything else shares the parent's handle.
    let backend: Arc<dyn TrackingBackend> = if payload.backend_uri.starts_with("file:") {
        Arc::new(FileStoreBackend::open(&payload.backend_uri)?)
    } else {
        shared_backend
    };

    if backend.active_run().map(|run| run.run_id) != Some(payload.run_id.clone()) {
        backend.resume_run(&payload.run_id)?;
    }

    let child = Tracker::from_parts(
        backend,
        targets,
        mappings,
        functions,
        "worker".to_string(),
        payload.config.clone(),
        important,
    );
    child.activate_tracking();

    for module in &payload.wrapped_modules {
        if child.targets().module(module).is_none() {
            log::warn!(
                target: "trackpads::parallel",
                "wrapped module '{}' is not registered in the worker",
                module
            );
        }
    }

    // Seed the worker cache with the parent's run scope so rendezvous
    // state is visible.
    child.cache().merge(&payload.run_id, &payload.cache);

    let result = child.call(&payload.task, &payload.args)?;

    let output = WorkerOutput {
        result,
        cache: child.cache().snapshot(&payload.run_id),
    };
    serde_json::to_vec(&output).map_err(|err| {
        enverr!(ErrorCode::SerializationFailed, "failed to encode worker output").with_source(err)
    })
}
