//! Logging functions: the user-visible extension point.
//!
//! A logging function runs around a tracked target with an optional pre
//! phase and an optional post phase. Either phase may report "not
//! implemented" and be skipped silently; any other failure is isolated per
//! logger by the dispatcher.

mod builtin;
mod registry;

pub use builtin::{
    InitLogger, InputLogger, LogLogger, MetricLogger, OutputLogger, ParametersLogger,
};
pub use registry::FunctionRegistry;

use std::sync::Arc;

use bitflags::bitflags;
use serde_json::{Map, Value};
use trackpads_errors::TrackError;

use crate::mapping::TargetMapping;
use crate::session::Tracker;
use crate::targets::{CallArgs, CallShape, ContainerRef, Receiver};

bitflags! {
    /// Which phases a logging function implements. Consulted when the
    /// dispatcher composes a chain so capability mismatches stay cheap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoggerPhases: u8 {
        const PRE = 0b01;
        const POST = 0b10;
    }
}

/// Everything a logging function sees about the surrounding dispatch.
pub struct LoggerEnv<'a> {
    pub tracker: &'a Arc<Tracker>,
    /// Mapping that caused the target to be wrapped.
    pub mapping: &'a Arc<TargetMapping>,
    /// Container owning the wrapped member.
    pub container: &'a ContainerRef,
    /// Member name of the wrapped target.
    pub member: &'a str,
    pub shape: CallShape,
    pub receiver: Option<&'a Receiver>,
    /// Call arguments as passed by the caller.
    pub args: &'a CallArgs,
    /// Static parameters overlaid with the configuration's `with` bag and
    /// the caller's keyword arguments (callers win).
    pub params: &'a Map<String, Value>,
}

impl<'a> LoggerEnv<'a> {
    /// Stable identifier of the call site: `container.member`.
    pub fn call_path(&self) -> String {
        format!("{}.{}", self.container.path(), self.member)
    }
}

/// Result of one logger phase.
pub enum PhaseResult {
    /// Phase ran; pre phases may thread a value through to post.
    Ok(Option<Value>),
    /// Phase is not provided by this logger; skipped silently.
    NotImplemented,
    /// The logger refuses to run for this call; short-circuit to the next
    /// callback without a failure tag.
    NoCall,
    /// Escape hatch: propagated verbatim, never caught by the dispatcher.
    PassThrough(TrackError),
    /// Isolated failure: failure tag is set and the dispatch continues.
    Failed(TrackError),
}

/// A user or library supplied logging function.
pub trait LoggingFunction: Send + Sync {
    /// Name the function registry knows this logger under.
    fn name(&self) -> &str;

    /// Declared phase capabilities.
    fn phases(&self) -> LoggerPhases {
        LoggerPhases::PRE | LoggerPhases::POST
    }

    /// Parameters baked into the logger at construction time. Overlaid by
    /// the configuration's `with` bag and the caller's kwargs.
    fn static_parameters(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Root modules that must be registered for this logger to run.
    fn needed_packages(&self) -> &[&str] {
        &[]
    }

    /// Runs before the target.
    fn pre(&self, _env: &LoggerEnv<'_>) -> PhaseResult {
        PhaseResult::NotImplemented
    }

    /// Runs after the target with its result and the pre phase's value.
    fn post(&self, _env: &LoggerEnv<'_>, _result: &Value, _pre_value: Option<&Value>) -> PhaseResult {
        PhaseResult::NotImplemented
    }
}
