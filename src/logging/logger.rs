use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, Once, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::Serialize;
use trackpads_errors::{ErrorCode, TrackError};
use uuid::Uuid;

thread_local! {
    static ERROR_CODE_OVERRIDE: Cell<Option<ErrorCode>> = Cell::new(None);
}

static LOGGER_INSTANCE: OnceCell<&'static TrackerLogger> = OnceCell::new();
static INIT_LOGGER: Once = Once::new();

/// Logging destination and verbosity, applied by the session builder.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

/// Install the structured logger once per process. `default_filter` follows
/// the `RUST_LOG` grammar and is used when the environment does not override
/// verbosity.
pub fn init_logging_with_default(default_filter: &str) {
    INIT_LOGGER.call_once(|| {
        let default_spec = FilterSpec::parse(default_filter, LevelFilter::Warn)
            .unwrap_or_else(|_| FilterSpec::new(LevelFilter::Warn));

        let initial_spec = std::env::var("RUST_LOG")
            .ok()
            .and_then(|spec| FilterSpec::parse(&spec, default_spec.global).ok())
            .unwrap_or_else(|| default_spec.clone());

        let logger = TrackerLogger::new(default_spec, initial_spec);
        let leaked: &'static TrackerLogger = Box::leak(Box::new(logger));
        log::set_logger(leaked).expect("tracker logger already initialised");
        log::set_max_level(leaked.filter.read().expect("filter lock").max_level());
        let _ = LOGGER_INSTANCE.set(leaked);
    });
}

/// Re-apply verbosity and destination from builder settings.
pub(crate) fn apply_log_settings(settings: &LogSettings) {
    if let Some(logger) = LOGGER_INSTANCE.get() {
        logger.apply_settings(settings);
    }
}

/// Run `op` with `code` stamped on every log record emitted from this thread.
pub fn with_error_code<F, R>(code: ErrorCode, op: F) -> R
where
    F: FnOnce() -> R,
{
    ERROR_CODE_OVERRIDE.with(|cell| {
        let previous = cell.replace(Some(code));
        let result = op();
        cell.set(previous);
        result
    })
}

/// Stamp subsequent log records with the backend run currently active.
pub fn set_active_run_id(run_id: Option<String>) {
    if let Some(logger) = LOGGER_INSTANCE.get() {
        let mut guard = logger.run_id.write().expect("run id lock");
        *guard = run_id;
    }
}

/// Emit a [`TrackError`] through the facade with its code attached.
pub fn log_track_error(label: &str, err: &TrackError) {
    let mut message = format!("{}: {}", label, err.message());
    if !err.context.is_empty() {
        message.push_str(" (");
        for (idx, (key, value)) in err.context.iter().enumerate() {
            if idx > 0 {
                message.push_str(", ");
            }
            message.push_str(key);
            message.push('=');
            message.push_str(value);
        }
        message.push(')');
    }
    with_error_code(err.code, || {
        log::error!(target: "trackpads::errors", "{}", message);
    });
}

struct TrackerLogger {
    process_id: String,
    run_id: RwLock<Option<String>>,
    default_filter: FilterSpec,
    filter: RwLock<FilterSpec>,
    writer: Mutex<Destination>,
}

impl TrackerLogger {
    fn new(default_filter: FilterSpec, initial: FilterSpec) -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            run_id: RwLock::new(None),
            writer: Mutex::new(Destination::Stderr),
            filter: RwLock::new(initial),
            default_filter,
        }
    }

    fn apply_settings(&self, settings: &LogSettings) {
        let new_filter = match settings.level.as_deref() {
            Some(spec) if !spec.trim().is_empty() => {
                match FilterSpec::parse(spec, self.default_filter.global) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        with_error_code(ErrorCode::InvalidConfig, || {
                            log::warn!(
                                target: "trackpads::logging",
                                "invalid log level filter '{}'; reverting to default",
                                spec
                            );
                        });
                        self.default_filter.clone()
                    }
                }
            }
            _ => self.default_filter.clone(),
        };

        {
            let mut guard = self.filter.write().expect("filter lock");
            *guard = new_filter.clone();
        }
        log::set_max_level(new_filter.max_level());

        let destination = match settings.file.as_deref() {
            Some(path) => match open_log_file(path) {
                Ok(file) => Destination::File(file),
                Err(err) => {
                    with_error_code(ErrorCode::Io, || {
                        log::warn!(
                            target: "trackpads::logging",
                            "failed to open log file '{}': {}",
                            path.display(),
                            err
                        );
                    });
                    Destination::Stderr
                }
            },
            None => Destination::Stderr,
        };
        *self.writer.lock().expect("writer lock") = destination;
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.filter.read().expect("filter lock").allows(metadata)
    }

    fn write_entry(&self, entry: &LogEntry<'_>) {
        match serde_json::to_vec(entry) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                if let Err(err) = self.writer.lock().expect("writer lock").write_all(&bytes) {
                    let mut stderr = io::stderr().lock();
                    let _ = stderr.write_all(&bytes);
                    let _ = writeln!(
                        stderr,
                        "{{\"process_id\":\"{}\",\"message\":\"logger write failure: {}\"}}",
                        self.process_id, err
                    );
                }
            }
            Err(_) => {
                let mut stderr = io::stderr().lock();
                let _ = writeln!(
                    stderr,
                    "{{\"process_id\":\"{}\",\"message\":\"failed to encode log entry\"}}",
                    self.process_id
                );
            }
        }
    }
}

impl Log for TrackerLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let error_code = ERROR_CODE_OVERRIDE
            .with(|cell| cell.get())
            .map(|code| code.as_str());
        let run_id = self.run_id.read().expect("run id lock").clone();

        let entry = LogEntry {
            ts_micros: current_timestamp_micros(),
            level: record.level().as_str(),
            target: record.target(),
            process_id: &self.process_id,
            run_id: run_id.as_deref(),
            message: record.args().to_string(),
            error_code,
            module_path: record.module_path(),
            file: record.file(),
            line: record.line(),
        };

        self.write_entry(&entry);
    }

    fn flush(&self) {
        let _ = self.writer.lock().expect("writer lock").flush();
    }
}

#[derive(Clone)]
struct FilterSpec {
    global: LevelFilter,
    targets: Vec<(String, LevelFilter)>,
}

impl FilterSpec {
    fn new(global: LevelFilter) -> Self {
        Self {
            global,
            targets: Vec::new(),
        }
    }

    fn parse(spec: &str, default_global: LevelFilter) -> Result<Self, ()> {
        let mut filter = Self::new(default_global);
        for part in spec.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some((target, level)) = trimmed.split_once('=') {
                let lvl = LevelFilter::from_str(level.trim()).map_err(|_| ())?;
                filter.targets.push((target.trim().to_string(), lvl));
            } else {
                filter.global = LevelFilter::from_str(trimmed).map_err(|_| ())?;
            }
        }
        Ok(filter)
    }

    fn allows(&self, metadata: &Metadata<'_>) -> bool {
        let mut allowed = self.global;
        let mut matched_len = 0usize;
        let target = metadata.target();
        for (pattern, level) in &self.targets {
            if target == pattern
                || target.starts_with(pattern) && target.chars().nth(pattern.len()) == Some(':')
            {
                if pattern.len() > matched_len {
                    matched_len = pattern.len();
                    allowed = *level;
                }
            }
        }
        allowed >= metadata.level().to_level_filter()
    }

    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .fold(self.global, |acc, (_, lvl)| acc.max(*lvl))
    }
}

#[derive(Serialize)]
struct LogEntry<'a> {
    ts_micros: i128,
    level: &'a str,
    target: &'a str,
    process_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

fn current_timestamp_micros() -> i128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => {
            let secs = duration.as_secs() as i128;
            let micros = duration.subsec_micros() as i128;
            secs * 1_000_000 + micros
        }
        Err(_) => 0,
    }
}

enum Destination {
    Stderr,
    File(File),
}

impl Destination {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Destination::Stderr => {
                let mut stderr = io::stderr().lock();
                stderr.write_all(bytes)?;
                stderr.flush()
            }
            Destination::File(file) => {
                file.write_all(bytes)?;
                file.flush()
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Destination::Stderr => io::stderr().lock().flush(),
            Destination::File(file) => file.flush(),
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    fn ensure_logger() {
        init_logging_with_default("trackpads=debug");
    }

    #[test]
    fn structured_log_records_process_and_error_code() {
        ensure_logger();
        let tmp = tempdir().expect("tempdir");
        let log_path = tmp.path().join("tracker.log");

        apply_log_settings(&LogSettings {
            level: Some("debug".to_string()),
            file: Some(log_path.clone()),
        });

        with_error_code(ErrorCode::LoggerNotFound, || {
            log::error!(target: "trackpads::tests", "sample message");
        });
        log::logger().flush();

        let contents = std::fs::read_to_string(&log_path).expect("read log file");
        let line = contents.lines().last().expect("log line");
        let json: Value = serde_json::from_str(line).expect("valid json log");

        assert!(json.get("process_id").and_then(Value::as_str).is_some());
        assert_eq!(
            json.get("error_code").and_then(Value::as_str),
            Some("ERR_LOGGER_NOT_FOUND")
        );
        assert_eq!(
            json.get("message").and_then(Value::as_str),
            Some("sample message")
        );

        apply_log_settings(&LogSettings::default());
    }

    #[test]
    fn run_id_is_stamped_when_set() {
        ensure_logger();
        let tmp = tempdir().expect("tempdir");
        let log_path = tmp.path().join("run.log");

        apply_log_settings(&LogSettings {
            level: Some("debug".to_string()),
            file: Some(log_path.clone()),
        });
        set_active_run_id(Some("run-42".to_string()));
        log::warn!(target: "trackpads::tests", "with run");
        log::logger().flush();
        set_active_run_id(None);

        let contents = std::fs::read_to_string(&log_path).expect("read log file");
        let line = contents.lines().last().expect("log line");
        let json: Value = serde_json::from_str(line).expect("valid json log");
        assert_eq!(json.get("run_id").and_then(Value::as_str), Some("run-42"));

        apply_log_settings(&LogSettings::default());
    }

    #[test]
    fn filter_spec_prefers_longest_target_match() {
        let spec = FilterSpec::parse(
            "warn,trackpads=info,trackpads::dispatch=trace",
            LevelFilter::Warn,
        )
        .expect("parse spec");
        assert_eq!(spec.max_level(), LevelFilter::Trace);
    }
}
