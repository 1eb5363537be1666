use once_cell::sync::OnceCell;

/// Metrics interface allowing pluggable sinks (default: no-op).
pub trait TrackerMetrics: Send + Sync {
    /// A dispatch bypassed its hook chain (recursion guard, empty chain).
    fn record_skipped_dispatch(&self, _reason: &'static str) {}
    /// A logging function failed and was isolated from the target call.
    fn record_logger_failure(&self, _logger: &str, _error_code: Option<&str>) {}
    /// A failed chain was retried against the original target.
    fn record_retry(&self, _target: &str) {}
    /// A mapping was discarded (duplicate reference, parse failure).
    fn record_discarded_mapping(&self, _reason: &'static str) {}
}

struct NoopMetrics;

impl TrackerMetrics for NoopMetrics {}

static METRICS_SINK: OnceCell<Box<dyn TrackerMetrics>> = OnceCell::new();

fn metrics_sink() -> &'static dyn TrackerMetrics {
    METRICS_SINK
        .get_or_init(|| Box::new(NoopMetrics) as Box<dyn TrackerMetrics>)
        .as_ref()
}

/// Install a custom metrics sink. Intended for embedding or tests.
#[cfg_attr(not(test), allow(dead_code))]
pub fn install_metrics(metrics: Box<dyn TrackerMetrics>) -> Result<(), Box<dyn TrackerMetrics>> {
    METRICS_SINK.set(metrics)
}

pub fn record_skipped_dispatch(reason: &'static str) {
    metrics_sink().record_skipped_dispatch(reason);
}

pub fn record_logger_failure(logger: &str, error_code: Option<&str>) {
    metrics_sink().record_logger_failure(logger, error_code);
}

pub fn record_retry(target: &str) {
    metrics_sink().record_retry(target);
}

pub fn record_discarded_mapping(reason: &'static str) {
    metrics_sink().record_discarded_mapping(reason);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct CapturingMetrics {
        events: Arc<Mutex<Vec<MetricEvent>>>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum MetricEvent {
        Skipped(&'static str),
        LoggerFailure(String, Option<String>),
        Retry(String),
        Discarded(&'static str),
    }

    impl CapturingMetrics {
        pub fn take(&self) -> Vec<MetricEvent> {
            let mut guard = self.events.lock().expect("metrics events lock");
            let events = guard.clone();
            guard.clear();
            events
        }
    }

    impl TrackerMetrics for CapturingMetrics {
        fn record_skipped_dispatch(&self, reason: &'static str) {
            self.events
                .lock()
                .expect("metrics events lock")
                .push(MetricEvent::Skipped(reason));
        }

        fn record_logger_failure(&self, logger: &str, error_code: Option<&str>) {
            self.events
                .lock()
                .expect("metrics events lock")
                .push(MetricEvent::LoggerFailure(
                    logger.to_string(),
                    error_code.map(|s| s.to_string()),
                ));
        }

        fn record_retry(&self, target: &str) {
            self.events
                .lock()
                .expect("metrics events lock")
                .push(MetricEvent::Retry(target.to_string()));
        }

        fn record_discarded_mapping(&self, reason: &'static str) {
            self.events
                .lock()
                .expect("metrics events lock")
                .push(MetricEvent::Discarded(reason));
        }
    }

    static CAPTURING: OnceCell<CapturingMetrics> = OnceCell::new();

    pub fn install() -> &'static CapturingMetrics {
        CAPTURING.get_or_init(|| {
            let metrics = CapturingMetrics::default();
            let _ = super::install_metrics(Box::new(metrics.clone()));
            metrics
        })
    }
}
