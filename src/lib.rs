//! Transparent tracking for registered library code.
//!
//! `trackpads` intercepts calls to targets named in mapping documents,
//! interposes a configurable chain of logging functions around each call,
//! and ships the captured parameters, metrics, tags and artifacts to an
//! experiment-tracking backend. Targets are registered as module
//! blueprints; the interceptor wraps matching members at registration time
//! and propagates mappings across inheritance, so user subclasses of
//! tracked classes are tracked too.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trackpads::{CallArgs, ModuleBlueprint, TrackerBuilder};
//!
//! let tracker = TrackerBuilder::new().experiment("demo").build()?;
//! tracker.register_module(
//!     ModuleBlueprint::new("lib.mod")
//!         .function("f", Arc::new(|env| {
//!             let a = env.args.args[0].as_i64().unwrap_or(0);
//!             let b = env.args.args[1].as_i64().unwrap_or(0);
//!             Ok(serde_json::json!(a + b))
//!         })),
//! )?;
//! let out = tracker.call("lib.mod.f", &CallArgs::positional([2.into(), 3.into()]))?;
//! assert_eq!(out, serde_json::json!(5));
//! # Ok::<(), trackpads_errors::TrackError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod interception;
pub mod loggers;
pub mod logging;
pub mod mapping;
pub mod parallel;
pub mod session;
pub mod targets;
pub mod timing;
pub mod wrapping;

pub use backend::{
    FileStoreBackend, InMemoryBackend, IntermediateRun, RunInfo, TrackingBackend, WriteFormat,
};
pub use cache::{CacheSnapshot, TrackerCache};
pub use config::{EventConfig, OnSelector, TrackingConfig, CONFIG_TAG};
pub use dispatch::{call_depth, DispatchOutcome};
pub use hooks::{resolve_hooks, ResolvedHook};
pub use loggers::{FunctionRegistry, LoggerEnv, LoggerPhases, LoggingFunction, PhaseResult};
pub use mapping::{
    Algorithm, DefaultHooks, Granularity, Hook, HookSelector, MappingDocument, MappingRegistry,
    TargetMapping,
};
pub use parallel::{parallel_map, TaskPayload};
pub use session::{Tracker, TrackerBuilder};
pub use targets::{
    CallArgs, CallEnv, CallShape, ClassBlueprint, ContainerRef, Instance, ModuleBlueprint,
    NativeFn, Receiver, TargetRegistry,
};
pub use timing::{add_run_time, timed, TimingOutcome};
pub use trackpads_errors::{ErrorCode, ErrorKind, TrackError, TrackResult};
pub use wrapping::{shadow_key, Dispatcher};
