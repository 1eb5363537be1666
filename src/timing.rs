//! Phase timing keeper.
//!
//! Each dispatch phase records its elapsed time under a stable key derived
//! from the call location. Entries accumulate in the run cache and are
//! flushed as a `timings` artifact when the run ends. A duplicate key is
//! benign and leaves the first record in place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::backend::WriteFormat;
use crate::dispatch::call_depth;
use crate::session::Tracker;

const TIMINGS_KEY: &str = "timings";

/// Result of recording a timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingOutcome {
    Recorded,
    /// A timing already exists for the key; ignored.
    AlreadyDefined,
}

/// Run `f`, returning its output and wall-clock duration.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let ret = f();
    (ret, start.elapsed())
}

/// Record the elapsed time of `name` in the active run's timing table and
/// make sure the flush hook is registered.
pub fn add_run_time(tracker: &Arc<Tracker>, name: &str, elapsed: Duration) -> TimingOutcome {
    let Some(run_id) = tracker.active_run_id() else {
        return TimingOutcome::Recorded;
    };

    tracker.register_post_fn("timings", {
        let tracker = Arc::clone(tracker);
        move || flush_timings(&tracker)
    });

    let cache = tracker.cache();
    let mut table = cache
        .run_get(&run_id, TIMINGS_KEY)
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default();

    if table.contains_key(name) {
        return TimingOutcome::AlreadyDefined;
    }

    table.insert(
        name.to_string(),
        json!({
            "seconds": elapsed.as_secs_f64(),
            "depth": call_depth(),
        }),
    );
    log::info!(
        target: "trackpads::timing",
        "{} done after {:.6}s",
        name,
        elapsed.as_secs_f64()
    );
    cache.run_add(&run_id, TIMINGS_KEY, Value::Object(table));
    TimingOutcome::Recorded
}

/// Render the accumulated timings and attach them as an artifact. Runs as
/// a post-run function.
pub(crate) fn flush_timings(tracker: &Arc<Tracker>) {
    let Some(run_id) = tracker.active_run_id() else {
        return;
    };
    let Some(table) = tracker
        .cache()
        .run_get(&run_id, TIMINGS_KEY)
        .and_then(|value| value.as_object().cloned())
    else {
        return;
    };

    let mut out = String::new();
    for (name, entry) in &table {
        let depth = entry.get("depth").and_then(Value::as_u64).unwrap_or(0);
        let seconds = entry.get("seconds").and_then(Value::as_f64).unwrap_or(0.0);
        for _ in 1..depth.max(1) {
            out.push('\t');
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&format!("{:.6}s\n", seconds));
    }

    if let Err(err) =
        tracker.log_mem_artifact(TIMINGS_KEY, &Value::String(out), WriteFormat::Text)
    {
        crate::logging::log_track_error("failed to flush timings", &err);
    }
}
