//! Dispatcher runtime: the call-time behavior of wrapped targets.

mod runtime;
mod stack;

pub use runtime::{dispatch, invoke_slot};
pub use stack::{call_depth, CallRecord};

use serde_json::Value;
use trackpads_errors::TrackError;

/// Result of folding a logger chain over a target call.
///
/// Control-flow signals that the original system expressed as sentinel
/// exceptions are explicit variants here and fold deterministically.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The chain ran to completion; this is the target's value.
    Ok(Value),
    /// The hook chain was bypassed (recursion guard, empty chain); the
    /// target still ran and this is its value.
    Skip(Value),
    /// The target or chain failed after all failure policies ran.
    Abort(TrackError),
    /// Escape hatch raised by a logger; propagated verbatim, never caught.
    PassThrough(TrackError),
}

impl DispatchOutcome {
    pub fn into_result(self) -> Result<Value, TrackError> {
        match self {
            DispatchOutcome::Ok(value) | DispatchOutcome::Skip(value) => Ok(value),
            DispatchOutcome::Abort(err) | DispatchOutcome::PassThrough(err) => Err(err),
        }
    }
}
