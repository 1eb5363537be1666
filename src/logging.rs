//! Diagnostics utilities: structured logging and metrics sinks.
//!
//! The tracking core logs through the `log` facade; the logger installed
//! here renders JSON lines stamped with a per-process id, the active run id
//! and the error code of the surrounding failure, so run artifacts and
//! console diagnostics can be correlated after the fact.

mod logger;
mod metrics;

pub use logger::{
    init_logging_with_default, log_track_error, set_active_run_id, with_error_code, LogSettings,
};
pub(crate) use logger::apply_log_settings;
pub use metrics::{
    install_metrics, record_discarded_mapping, record_logger_failure, record_retry,
    record_skipped_dispatch, TrackerMetrics,
};

#[cfg(test)]
pub use metrics::test_support;
