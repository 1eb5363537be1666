//! Logging functions bundled with the default configuration.
//!
//! These are intentionally shallow: each one exercises the dispatcher
//! contract (phases, parameter bags, backend side effects) without pulling
//! in library-specific scraping logic.

use serde_json::Value;
use trackpads_errors::TrackResult;

use crate::backend::WriteFormat;
use crate::loggers::{LoggerEnv, LoggerPhases, LoggingFunction, PhaseResult};

fn phase_from(result: TrackResult<()>) -> PhaseResult {
    match result {
        Ok(()) => PhaseResult::Ok(None),
        Err(err) => PhaseResult::Failed(err),
    }
}

fn write_format(env: &LoggerEnv<'_>) -> WriteFormat {
    env.params
        .get("write_format")
        .and_then(Value::as_str)
        .and_then(WriteFormat::parse)
        .unwrap_or(WriteFormat::Text)
}

/// Records the caller's keyword arguments as run parameters.
pub struct ParametersLogger;

impl LoggingFunction for ParametersLogger {
    fn name(&self) -> &str {
        "parameters"
    }

    fn phases(&self) -> LoggerPhases {
        LoggerPhases::POST
    }

    fn post(&self, env: &LoggerEnv<'_>, _result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        let prefix = env.call_path();
        for (key, value) in &env.args.kwargs {
            if let Err(err) = env
                .tracker
                .log_param(&format!("{}.{}", prefix, key), &value_to_display(value))
            {
                return PhaseResult::Failed(err);
            }
        }
        PhaseResult::Ok(None)
    }
}

/// Captures the positional arguments as an input artifact.
pub struct InputLogger;

impl LoggingFunction for InputLogger {
    fn name(&self) -> &str {
        "input"
    }

    fn phases(&self) -> LoggerPhases {
        LoggerPhases::PRE
    }

    fn pre(&self, env: &LoggerEnv<'_>) -> PhaseResult {
        let format = write_format(env);
        let name = format!("{}/input", env.call_path());
        let payload = Value::Array(env.args.args.clone());
        phase_from(env.tracker.log_mem_artifact(&name, &payload, format))
    }
}

/// Captures the target's return value as an output artifact.
pub struct OutputLogger;

impl LoggingFunction for OutputLogger {
    fn name(&self) -> &str {
        "output"
    }

    fn phases(&self) -> LoggerPhases {
        LoggerPhases::POST
    }

    fn post(&self, env: &LoggerEnv<'_>, result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        let format = write_format(env);
        let name = format!("{}/output", env.call_path());
        phase_from(env.tracker.log_mem_artifact(&name, result, format))
    }
}

/// Forwards numeric results to the metric store.
pub struct MetricLogger;

impl LoggingFunction for MetricLogger {
    fn name(&self) -> &str {
        "metric"
    }

    fn phases(&self) -> LoggerPhases {
        LoggerPhases::POST
    }

    fn post(&self, env: &LoggerEnv<'_>, result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        match result.as_f64() {
            Some(value) => {
                let step = env.params.get("step").and_then(Value::as_i64);
                phase_from(env.tracker.log_metric(&env.call_path(), value, step))
            }
            None => {
                log::debug!(
                    target: "trackpads::loggers",
                    "metric logger skipped non-numeric result of {}",
                    env.call_path()
                );
                PhaseResult::Ok(None)
            }
        }
    }
}

/// Plain trace of entry and exit.
pub struct LogLogger;

impl LoggingFunction for LogLogger {
    fn name(&self) -> &str {
        "log"
    }

    fn pre(&self, env: &LoggerEnv<'_>) -> PhaseResult {
        log::info!(
            target: "trackpads::loggers",
            "entering {} ({} positional args)",
            env.call_path(),
            env.args.args.len()
        );
        PhaseResult::Ok(None)
    }

    fn post(&self, env: &LoggerEnv<'_>, _result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        log::info!(target: "trackpads::loggers", "leaving {}", env.call_path());
        PhaseResult::Ok(None)
    }
}

/// Tags the run with every tracked construction.
pub struct InitLogger;

impl LoggingFunction for InitLogger {
    fn name(&self) -> &str {
        "init"
    }

    fn phases(&self) -> LoggerPhases {
        LoggerPhases::POST
    }

    fn post(&self, env: &LoggerEnv<'_>, _result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        let receiver = env
            .receiver
            .map(|r| r.identity().to_string())
            .unwrap_or_else(|| "<unbound>".to_string());
        phase_from(
            env.tracker
                .set_tag(&format!("pads.init.{}", env.container.path()), &receiver),
        )
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_match_default_config_events() {
        let config = crate::config::TrackingConfig::default();
        for name in ["parameters", "input", "output", "metric", "log", "init"] {
            assert!(config.events.contains_key(name), "missing event {name}");
        }
        assert_eq!(ParametersLogger.name(), "parameters");
        assert_eq!(InitLogger.name(), "init");
    }

    #[test]
    fn phase_capabilities_are_declared() {
        assert_eq!(ParametersLogger.phases(), LoggerPhases::POST);
        assert_eq!(InputLogger.phases(), LoggerPhases::PRE);
        assert!(LogLogger.phases().contains(LoggerPhases::PRE | LoggerPhases::POST));
    }
}
