//! The tracker session: explicit context value tying the core together.
//!
//! A [`Tracker`] owns (or shares) the mapping registry, the function
//! registry, the target registry, the run cache and the backend handle.
//! There is no process-wide singleton; dispatchers, loggers and workers
//! all receive the tracker as an `Arc`.

mod builder;

pub use builder::TrackerBuilder;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use trackpads_errors::{enverr, usage, ErrorCode, TrackResult};

use crate::backend::{IntermediateRun, RunInfo, TrackingBackend, WriteFormat};
use crate::cache::TrackerCache;
use crate::config::{TrackingConfig, CONFIG_TAG};
use crate::dispatch::invoke_slot;
use crate::interception;
use crate::loggers::FunctionRegistry;
use crate::logging::set_active_run_id;
use crate::mapping::{DefaultHooks, Hook, HookSelector, MappingRegistry, TargetMapping};
use crate::targets::{
    CallArgs, Instance, ModuleBlueprint, ModuleDef, Receiver, Resolved, TargetRegistry,
};
use crate::wrapping;

type PostRunFn = Box<dyn Fn() + Send + Sync>;

/// The tracking application.
pub struct Tracker {
    backend: Arc<dyn TrackingBackend>,
    targets: Arc<TargetRegistry>,
    mappings: Arc<MappingRegistry>,
    functions: Arc<FunctionRegistry>,
    cache: TrackerCache,
    experiment: String,
    base_config: TrackingConfig,
    config_cache: DashMap<String, TrackingConfig>,
    important_modules: Vec<String>,
    tracking_active: AtomicBool,
    post_run_fns: Mutex<IndexMap<String, PostRunFn>>,
}

impl Tracker {
    pub(crate) fn from_parts(
        backend: Arc<dyn TrackingBackend>,
        targets: Arc<TargetRegistry>,
        mappings: Arc<MappingRegistry>,
        functions: Arc<FunctionRegistry>,
        experiment: String,
        base_config: TrackingConfig,
        important_modules: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            targets,
            mappings,
            functions,
            cache: TrackerCache::new(),
            experiment,
            base_config,
            config_cache: DashMap::new(),
            important_modules,
            tracking_active: AtomicBool::new(false),
            post_run_fns: Mutex::new(IndexMap::new()),
        })
    }

    /// Minimal tracker over an in-memory backend for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        Self::from_parts(
            Arc::new(crate::backend::InMemoryBackend::new()),
            Arc::new(TargetRegistry::new()),
            Arc::new(MappingRegistry::new()),
            Arc::new(FunctionRegistry::new()),
            "tests".to_string(),
            TrackingConfig::default(),
            interception::default_important_modules(),
        )
    }

    // --- accessors ---

    pub fn backend(&self) -> &Arc<dyn TrackingBackend> {
        &self.backend
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    pub(crate) fn targets_arc(&self) -> Arc<TargetRegistry> {
        Arc::clone(&self.targets)
    }

    pub fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    pub(crate) fn mappings_arc(&self) -> Arc<MappingRegistry> {
        Arc::clone(&self.mappings)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub(crate) fn functions_arc(&self) -> Arc<FunctionRegistry> {
        Arc::clone(&self.functions)
    }

    pub fn cache(&self) -> &TrackerCache {
        &self.cache
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn important_modules(&self) -> &[String] {
        &self.important_modules
    }

    pub fn is_tracking_active(&self) -> bool {
        self.tracking_active.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_tracking_active(&self) -> bool {
        self.tracking_active.swap(true, Ordering::SeqCst)
    }

    /// True when the root module `package` (or a submodule of it) is
    /// registered.
    pub fn has_root_module(&self, package: &str) -> bool {
        self.targets
            .module_names()
            .iter()
            .any(|name| name == package || name.starts_with(&format!("{}.", package)))
    }

    // --- run management ---

    pub fn active_run_id(&self) -> Option<String> {
        self.backend.active_run().map(|run| run.run_id)
    }

    /// Start a top-level run, attach the configuration tag and mirror the
    /// git head when asked to.
    pub fn start_run(&self) -> TrackResult<RunInfo> {
        let run = self.backend.start_run(&self.experiment, false)?;
        self.on_run_started(&run)?;
        Ok(run)
    }

    pub(crate) fn on_run_started(&self, run: &RunInfo) -> TrackResult<()> {
        set_active_run_id(Some(run.run_id.clone()));
        self.backend.set_tag(CONFIG_TAG, &self.base_config.to_tag()?)?;
        self.config_cache
            .insert(run.run_id.clone(), self.base_config.clone());
        if self.base_config.mirror_git {
            self.mirror_git_head();
        }
        Ok(())
    }

    /// End the active run: post-run functions first, then the cache scope,
    /// then the backend. Total on all paths.
    pub fn end_run(&self) -> TrackResult<()> {
        let run_id = self.active_run_id();

        let drained: Vec<(String, PostRunFn)> = {
            let mut fns = self.post_run_fns.lock().expect("post run fns lock");
            fns.drain(..).collect()
        };
        for (name, f) in drained {
            log::debug!(target: "trackpads::session", "running post-run fn '{}'", name);
            f();
        }

        if let Some(run_id) = &run_id {
            self.cache.run_clear(run_id);
            self.config_cache.remove(run_id);
        }
        self.backend.end_run()?;
        set_active_run_id(self.active_run_id());
        Ok(())
    }

    /// Scoped nested run; the enclosing run is restored when the guard
    /// drops.
    pub fn intermediate_run(&self) -> TrackResult<IntermediateRun> {
        IntermediateRun::open(Arc::clone(&self.backend), &self.experiment)
    }

    /// Register a callback to run once when the active run ends. A second
    /// registration under the same name is skipped.
    pub fn register_post_fn(&self, name: &str, f: impl Fn() + Send + Sync + 'static) {
        let mut fns = self.post_run_fns.lock().expect("post run fns lock");
        if fns.contains_key(name) {
            log::debug!(
                target: "trackpads::session",
                "post-run fn '{}' already registered; skipped",
                name
            );
            return;
        }
        fns.insert(name.to_string(), Box::new(f));
    }

    /// Configuration of the active run, reloaded from the run tag when the
    /// process re-enters a run it did not configure.
    pub fn current_config(&self) -> TrackingConfig {
        let Some(run_id) = self.active_run_id() else {
            return self.base_config.clone();
        };
        if let Some(cached) = self.config_cache.get(&run_id) {
            return cached.value().clone();
        }
        let from_tag = self
            .backend
            .get_tag(&run_id, CONFIG_TAG)
            .ok()
            .flatten()
            .and_then(|raw| TrackingConfig::from_tag(&raw).ok());
        let config = from_tag.unwrap_or_else(|| self.base_config.clone());
        self.config_cache.insert(run_id, config.clone());
        config
    }

    fn mirror_git_head(&self) {
        match std::fs::read_to_string(Path::new(".git").join("HEAD")) {
            Ok(head) => {
                let _ = self.backend.set_tag("pads.source.git.head", head.trim());
            }
            Err(err) => {
                log::debug!(
                    target: "trackpads::session",
                    "no git head to mirror: {}",
                    err
                );
            }
        }
    }

    // --- logging passthroughs ---

    pub fn log_param(&self, key: &str, value: &str) -> TrackResult<()> {
        self.backend.log_param(key, value)
    }

    pub fn log_metric(&self, key: &str, value: f64, step: Option<i64>) -> TrackResult<()> {
        self.backend.log_metric(key, value, step)
    }

    pub fn set_tag(&self, key: &str, value: &str) -> TrackResult<()> {
        self.backend.set_tag(key, value)
    }

    pub fn log_artifact(&self, path: &Path) -> TrackResult<()> {
        self.backend.log_artifact(path)
    }

    /// Serialize `content` per `format` and attach it to the active run.
    pub fn log_mem_artifact(
        &self,
        name: &str,
        content: &Value,
        format: WriteFormat,
    ) -> TrackResult<()> {
        let bytes = match format {
            WriteFormat::Text => match content {
                Value::String(text) => text.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            },
            WriteFormat::Json => serde_json::to_vec_pretty(content).map_err(|err| {
                enverr!(
                    ErrorCode::SerializationFailed,
                    "failed to encode artifact '{}'",
                    name
                )
                .with_source(err)
            })?,
        };
        self.backend.log_in_memory_artifact(name, &bytes, format)
    }

    // --- target registration and activation ---

    /// Register a module blueprint. While tracking is active this is the
    /// module-load event: the interceptor wraps matching targets and
    /// propagates mappings across inheritance before the call returns.
    pub fn register_module(
        self: &Arc<Self>,
        blueprint: ModuleBlueprint,
    ) -> TrackResult<Arc<ModuleDef>> {
        let module = self.targets.register_module(blueprint)?;
        if self.is_tracking_active() {
            interception::on_module_registered(self, &module);
        }
        Ok(module)
    }

    /// Install the interception hook and re-walk modules registered before
    /// activation.
    pub fn activate_tracking(self: &Arc<Self>) {
        interception::activate(self);
    }

    /// Wrap an individual target ad hoc, generating a default mapping that
    /// binds the given events to every member when none is registered.
    pub fn track(self: &Arc<Self>, reference: &str, events: &[&str]) -> TrackResult<()> {
        let resolved = self.targets.resolve(reference).ok_or_else(|| {
            usage!(
                ErrorCode::UnknownTarget,
                "cannot track unknown reference '{}'",
                reference
            )
        })?;

        let mapping = match self.mappings.find_reference(reference) {
            Some(mapping) => mapping,
            None => {
                log::warn!(
                    target: "trackpads::session",
                    "tracking '{}' without a mapping definition; generating a default one",
                    reference
                );
                let library = reference.split('.').next().unwrap_or(reference).to_string();
                let hooks = events
                    .iter()
                    .map(|event| Hook::new(*event, HookSelector::Always))
                    .collect();
                let mapping = TargetMapping {
                    reference: reference.to_string(),
                    library,
                    library_version: String::new(),
                    algorithm: reference.to_string(),
                    hooks,
                    default_hooks: Arc::new(DefaultHooks::default()),
                    source: None,
                    inherited_from: None,
                };
                self.mappings.add_mapping(mapping.clone());
                Arc::new(mapping)
            }
        };

        wrapping::wrap(&resolved, &mapping);
        Ok(())
    }

    // --- call surface ---

    /// Call a module-level function by dotted path.
    pub fn call(self: &Arc<Self>, reference: &str, args: &CallArgs) -> TrackResult<Value> {
        match self.targets.resolve(reference) {
            Some(Resolved::Member(container, member)) => {
                let slot = match &container {
                    crate::targets::ContainerRef::Class(class) => {
                        class.resolve_member(&member).map(|(_, slot)| slot)
                    }
                    crate::targets::ContainerRef::Module(_) => container
                        .members()
                        .get(&member)
                        .map(|entry| entry.value().clone()),
                }
                .ok_or_else(|| {
                    usage!(ErrorCode::UnknownTarget, "member '{}' vanished", reference)
                })?;
                invoke_slot(self, &slot, None, args)
            }
            Some(_) => Err(usage!(
                ErrorCode::UnknownTarget,
                "'{}' is not a callable member",
                reference
            )),
            None => Err(usage!(
                ErrorCode::UnknownTarget,
                "unknown reference '{}'",
                reference
            )),
        }
    }

    /// Construct an instance of a registered class, dispatching its
    /// constructor when one is declared.
    pub fn construct(
        self: &Arc<Self>,
        class_path: &str,
        args: &CallArgs,
    ) -> TrackResult<Arc<Instance>> {
        let class = self.targets.class(class_path).ok_or_else(|| {
            usage!(ErrorCode::UnknownTarget, "unknown class '{}'", class_path)
        })?;
        let instance = self.targets.new_instance(&class);
        if let Some((_, slot)) = class.resolve_member("init") {
            invoke_slot(
                self,
                &slot,
                Some(Receiver::Instance(Arc::clone(&instance))),
                args,
            )?;
        }
        Ok(instance)
    }

    /// Call a method through an instance; resolution walks the class's
    /// ancestor order.
    pub fn call_method(
        self: &Arc<Self>,
        instance: &Arc<Instance>,
        member: &str,
        args: &CallArgs,
    ) -> TrackResult<Value> {
        let (_, slot) = instance.class().resolve_member(member).ok_or_else(|| {
            usage!(
                ErrorCode::UnknownTarget,
                "'{}' has no member '{}'",
                instance.class().path(),
                member
            )
        })?;
        invoke_slot(
            self,
            &slot,
            Some(Receiver::Instance(Arc::clone(instance))),
            args,
        )
    }

    /// Call a classmethod or staticmethod through the class object.
    pub fn call_class_member(
        self: &Arc<Self>,
        class_path: &str,
        member: &str,
        args: &CallArgs,
    ) -> TrackResult<Value> {
        let class = self.targets.class(class_path).ok_or_else(|| {
            usage!(ErrorCode::UnknownTarget, "unknown class '{}'", class_path)
        })?;
        let (_, slot) = class.resolve_member(member).ok_or_else(|| {
            usage!(
                ErrorCode::UnknownTarget,
                "'{}' has no member '{}'",
                class_path,
                member
            )
        })?;
        let receiver = if slot.shape.takes_receiver() {
            Some(Receiver::Class(class))
        } else {
            None
        };
        invoke_slot(self, &slot, receiver, args)
    }

    /// Read a property through its (possibly wrapped) getter.
    pub fn get_property(
        self: &Arc<Self>,
        instance: &Arc<Instance>,
        member: &str,
    ) -> TrackResult<Value> {
        let (_, slot) = instance.class().resolve_member(member).ok_or_else(|| {
            usage!(
                ErrorCode::UnknownTarget,
                "'{}' has no member '{}'",
                instance.class().path(),
                member
            )
        })?;
        if slot.shape != crate::targets::CallShape::Property {
            return Err(usage!(
                ErrorCode::UnknownTarget,
                "member '{}' of '{}' is not a property",
                member,
                instance.class().path()
            ));
        }
        invoke_slot(
            self,
            &slot,
            Some(Receiver::Instance(Arc::clone(instance))),
            &CallArgs::none(),
        )
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("experiment", &self.experiment)
            .field("backend", &self.backend.uri())
            .field("tracking_active", &self.is_tracking_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_run_fns_run_once_and_dedupe() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let tracker = Tracker::for_tests();
        tracker.start_run().expect("run");

        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        tracker.register_post_fn("count", || {
            COUNTER.fetch_add(1, Ordering::SeqCst);
        });
        tracker.register_post_fn("count", || {
            COUNTER.fetch_add(10, Ordering::SeqCst);
        });

        tracker.end_run().expect("end");
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_cache_scope_dies_with_the_run() {
        let tracker = Tracker::for_tests();
        let run = tracker.start_run().expect("run");
        tracker.cache().run_add(&run.run_id, "stdout", json!("output"));
        tracker.end_run().expect("end");
        assert!(!tracker.cache().run_exists(&run.run_id, "stdout"));
    }

    #[test]
    fn current_config_reads_the_run_tag() {
        let tracker = Tracker::for_tests();
        tracker.start_run().expect("run");
        let config = tracker.current_config();
        assert_eq!(config, TrackingConfig::default());
    }

    #[test]
    fn config_falls_back_without_a_run() {
        let tracker = Tracker::for_tests();
        assert_eq!(tracker.current_config(), TrackingConfig::default());
    }
}
