//! Construction of a tracker session.

use std::path::PathBuf;
use std::sync::Arc;

use trackpads_errors::TrackResult;

use crate::backend::{FileStoreBackend, InMemoryBackend, TrackingBackend};
use crate::config::TrackingConfig;
use crate::interception;
use crate::loggers::{
    FunctionRegistry, InitLogger, InputLogger, LogLogger, MetricLogger, OutputLogger,
    ParametersLogger,
};
use crate::logging::{apply_log_settings, init_logging_with_default, LogSettings};
use crate::mapping::{MappingAggregator, MappingRegistry};
use crate::session::Tracker;
use crate::targets::TargetRegistry;

const DEFAULT_EXPERIMENT: &str = "Default-Pads";
const BACKEND_URI_ENV: &str = "PADS_BACKEND_URI";
const MAPPING_PATHS_ENV: &str = "PADS_MAPPING_PATHS";

/// Builder for a [`Tracker`]. The defaults mirror a plain install: file
/// store under the home directory, bundled logging functions, mapping
/// documents from the user's bindings directory, tracking activated.
pub struct TrackerBuilder {
    uri: Option<String>,
    experiment: Option<String>,
    mapping_paths: Vec<PathBuf>,
    inline_mappings: Vec<(String, String)>,
    include_default_mappings: bool,
    include_default_loggers: bool,
    config: TrackingConfig,
    backend: Option<Arc<dyn TrackingBackend>>,
    log_settings: LogSettings,
    important_modules: Option<Vec<String>>,
    activate: bool,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            uri: None,
            experiment: None,
            mapping_paths: Vec::new(),
            inline_mappings: Vec::new(),
            include_default_mappings: true,
            include_default_loggers: true,
            config: TrackingConfig::default(),
            backend: None,
            log_settings: LogSettings::default(),
            important_modules: None,
            activate: true,
        }
    }

    /// Backend URI (`file:…` or `mem:`). Overrides `PADS_BACKEND_URI`.
    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    pub fn experiment(mut self, name: &str) -> Self {
        self.experiment = Some(name.to_string());
        self
    }

    pub fn mapping_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mapping_paths.push(path.into());
        self
    }

    /// Supply a mapping document as inline TOML.
    pub fn mapping_inline(mut self, label: &str, contents: &str) -> Self {
        self.inline_mappings
            .push((label.to_string(), contents.to_string()));
        self
    }

    pub fn without_default_mappings(mut self) -> Self {
        self.include_default_mappings = false;
        self
    }

    pub fn without_default_loggers(mut self) -> Self {
        self.include_default_loggers = false;
        self
    }

    pub fn config(mut self, config: TrackingConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing backend instead of opening one from the URI.
    pub fn backend(mut self, backend: Arc<dyn TrackingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn log_settings(mut self, settings: LogSettings) -> Self {
        self.log_settings = settings;
        self
    }

    pub fn important_modules(mut self, modules: Vec<String>) -> Self {
        self.important_modules = Some(modules);
        self
    }

    /// Leave tracking inactive; `activate_tracking` can run later.
    pub fn deferred_activation(mut self) -> Self {
        self.activate = false;
        self
    }

    /// Build the tracker: open the backend, load mappings, register the
    /// bundled loggers, start a run when none is active, and activate
    /// tracking unless deferred.
    pub fn build(self) -> TrackResult<Arc<Tracker>> {
        init_logging_with_default("trackpads=warn");
        apply_log_settings(&self.log_settings);
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => open_backend(self.uri.as_deref())?,
        };

        let functions = Arc::new(FunctionRegistry::new());
        if self.include_default_loggers {
            register_default_loggers(&functions);
        }

        let mappings = Arc::new(MappingRegistry::new());
        let mut paths = Vec::new();
        if self.include_default_mappings {
            paths.extend(default_mapping_paths());
        }
        paths.extend(self.mapping_paths);
        mappings.load_paths(&paths)?;
        for (label, contents) in &self.inline_mappings {
            let mut aggregator = MappingAggregator::default();
            aggregator.ingest_inline(label, contents)?;
            for document in aggregator.finish() {
                mappings.add_document(document)?;
            }
        }

        let important = self
            .important_modules
            .unwrap_or_else(interception::default_important_modules);

        let tracker = Tracker::from_parts(
            backend,
            Arc::new(TargetRegistry::new()),
            mappings,
            functions,
            self.experiment
                .unwrap_or_else(|| DEFAULT_EXPERIMENT.to_string()),
            self.config,
            important,
        );

        match tracker.backend().active_run() {
            Some(run) => {
                // Tracking starts against an already-open run; adopt it.
                tracker.on_run_started(&run)?;
            }
            None => {
                tracker.start_run()?;
            }
        }

        if self.activate {
            tracker.activate_tracking();
        }
        Ok(tracker)
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn open_backend(uri: Option<&str>) -> TrackResult<Arc<dyn TrackingBackend>> {
    let uri = uri
        .map(str::to_string)
        .or_else(|| std::env::var(BACKEND_URI_ENV).ok())
        .unwrap_or_else(default_backend_uri);
    if uri == "mem:" {
        return Ok(Arc::new(InMemoryBackend::new()));
    }
    Ok(Arc::new(FileStoreBackend::open(&uri)?))
}

fn default_backend_uri() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("file:{}/.pads-runs", home)
}

fn register_default_loggers(functions: &FunctionRegistry) {
    functions.add_function("parameters", Arc::new(ParametersLogger));
    functions.add_function("input", Arc::new(InputLogger));
    functions.add_function("output", Arc::new(OutputLogger));
    functions.add_function("metric", Arc::new(MetricLogger));
    functions.add_function("log", Arc::new(LogLogger));
    functions.add_function("init", Arc::new(InitLogger));
}

/// Mapping documents shipped by the user: `~/.pads/bindings/*.toml` plus
/// anything named in `PADS_MAPPING_PATHS`.
fn default_mapping_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        let bindings = PathBuf::from(home).join(".pads").join("bindings");
        if let Ok(entries) = std::fs::read_dir(&bindings) {
            let mut found: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("toml"))
                .collect();
            found.sort();
            paths.extend(found);
        }
    }
    if let Ok(raw) = std::env::var(MAPPING_PATHS_ENV) {
        paths.extend(raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
    }
    paths
}
