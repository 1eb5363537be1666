//! Per-call protocol of the dispatcher.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use trackpads_errors::{target, ErrorCode, TrackError, TrackResult};

use crate::backend::WriteFormat;
use crate::dispatch::stack;
use crate::dispatch::DispatchOutcome;
use crate::hooks::{resolve_hooks, ResolvedHook};
use crate::logging::{record_logger_failure, record_retry, record_skipped_dispatch};
use crate::loggers::{LoggerEnv, LoggerPhases, PhaseResult};
use crate::session::Tracker;
use crate::targets::{CallArgs, CallEnv, MemberSlot, Receiver, SlotTarget};
use crate::timing::{add_run_time, timed};
use crate::wrapping::Dispatcher;

/// Failures threaded through the chain fold. Pass-through errors escape
/// every policy; plain failures are subject to retry and stdout capture.
enum ChainError {
    Failure(TrackError),
    PassThrough(TrackError),
}

type ChainResult = Result<Value, ChainError>;

/// Invoke a member slot: descriptor resolution first, then either the
/// pristine target or the dispatcher installed over it.
pub fn invoke_slot(
    tracker: &Arc<Tracker>,
    slot: &MemberSlot,
    receiver: Option<Receiver>,
    args: &CallArgs,
) -> TrackResult<Value> {
    if let Some(guard_field) = &slot.guard {
        let available = receiver
            .as_ref()
            .and_then(Receiver::instance)
            .map(|instance| instance.has_field(guard_field))
            .unwrap_or(false);
        if !available {
            return Err(target!(
                ErrorCode::UnknownTarget,
                "attribute-guarded member is unavailable: receiver lacks '{}'",
                guard_field
            ));
        }
    }

    match &slot.target {
        SlotTarget::Native(f) => f(CallEnv {
            tracker,
            receiver,
            args,
        }),
        SlotTarget::Wrapped(dispatcher) => dispatch(tracker, dispatcher, receiver, args),
    }
}

/// Run a wrapped target through its logger chain.
pub fn dispatch(
    tracker: &Arc<Tracker>,
    dispatcher: &Arc<Dispatcher>,
    receiver: Option<Receiver>,
    args: &CallArgs,
) -> TrackResult<Value> {
    let mapping = dispatcher.mapping();
    let container = dispatcher.container();
    let receiver_identity = receiver.as_ref().map(Receiver::identity);

    let _stack_guard = stack::push(mapping, container, dispatcher.member(), receiver_identity);

    if let Some(ancestor) = mapping.inherited_from.as_deref() {
        if tracker.active_run_id().is_some() {
            let _ = tracker.set_tag("pads.inherited_from", ancestor);
        }
    }

    let config = tracker.current_config();
    let hooks = resolve_hooks(
        &config,
        tracker.functions(),
        mapping,
        dispatcher.granularity(),
        dispatcher.member(),
    );

    if hooks.is_empty() {
        return call_original(tracker, dispatcher, &receiver, args)
            .map(DispatchOutcome::Skip)
            .and_then(DispatchOutcome::into_result);
    }

    // Recursion control happens after the push so the current call counts.
    let depth_exceeded = config.recursion_depth >= 0
        && stack::call_depth() as i64 > config.recursion_depth + 1;
    let identity_hit = config.recursion_identity
        && receiver_identity
            .map(|id| stack::receiver_already_deeper(container.id(), dispatcher.member(), id))
            .unwrap_or(false);
    if depth_exceeded || identity_hit {
        record_skipped_dispatch(if depth_exceeded {
            "recursion_depth"
        } else {
            "recursion_identity"
        });
        log::info!(
            target: "trackpads::dispatch",
            "skipping hooks of {} (recursion guard)",
            dispatcher.call_path()
        );
        return call_original(tracker, dispatcher, &receiver, args)
            .map(DispatchOutcome::Skip)
            .and_then(DispatchOutcome::into_result);
    }

    let outcome = match run_chain(tracker, dispatcher, &hooks, 0, &receiver, args) {
        Ok(value) => DispatchOutcome::Ok(value),
        Err(ChainError::PassThrough(err)) => DispatchOutcome::PassThrough(err),
        Err(ChainError::Failure(err)) => {
            match handle_chain_failure(tracker, dispatcher, &receiver, args, err, &config) {
                Ok(value) => DispatchOutcome::Ok(value),
                Err(err) => DispatchOutcome::Abort(err),
            }
        }
    };
    outcome.into_result()
}

/// Fold the chain right-to-left: hook `idx` wraps everything after it and
/// the original target sits innermost. `post` therefore unwinds in the
/// reverse order of `pre`.
fn run_chain(
    tracker: &Arc<Tracker>,
    dispatcher: &Arc<Dispatcher>,
    hooks: &[ResolvedHook],
    idx: usize,
    receiver: &Option<Receiver>,
    args: &CallArgs,
) -> ChainResult {
    let Some(hook) = hooks.get(idx) else {
        let call_path = dispatcher.call_path();
        let (result, elapsed) = timed(|| {
            call_original(tracker, dispatcher, receiver, args)
        });
        let value = result.map_err(ChainError::Failure)?;
        let _ = add_run_time(tracker, &call_path, elapsed);
        return Ok(value);
    };

    // A declared dependency that is not registered disables the logger for
    // this call only.
    for package in hook.logger.needed_packages() {
        if !tracker.has_root_module(package) {
            crate::logging::with_error_code(ErrorCode::DependencyMissing, || {
                log::warn!(
                    target: "trackpads::dispatch",
                    "can't run logger '{}': missing dependency '{}'",
                    hook.logger.name(),
                    package
                );
            });
            return run_chain(tracker, dispatcher, hooks, idx + 1, receiver, args);
        }
    }

    // Duplicate-hook guard: the same logger never runs twice concurrently
    // for the same receiver.
    let guard_identity = receiver
        .as_ref()
        .map(Receiver::identity)
        .unwrap_or_else(|| dispatcher.container().id());
    let Some(_hook_guard) = HookGuard::enter(tracker, guard_identity, hook.logger.name()) else {
        return run_chain(tracker, dispatcher, hooks, idx + 1, receiver, args);
    };

    let params = merge_params(hook, args);
    let env = LoggerEnv {
        tracker,
        mapping: dispatcher.mapping(),
        container: dispatcher.container(),
        member: dispatcher.member(),
        shape: dispatcher.shape(),
        receiver: receiver.as_ref(),
        args,
        params: &params,
    };
    let call_path = dispatcher.call_path();

    let mut pre_value = None;
    if hook.logger.phases().contains(LoggerPhases::PRE) {
        let (phase, elapsed) = timed(|| hook.logger.pre(&env));
        match phase {
            PhaseResult::Ok(value) => {
                let _ = add_run_time(
                    tracker,
                    &format!("{}.{}.pre", call_path, hook.logger.name()),
                    elapsed,
                );
                pre_value = value;
            }
            PhaseResult::NotImplemented => {}
            PhaseResult::NoCall => {
                return run_chain(tracker, dispatcher, hooks, idx + 1, receiver, args);
            }
            PhaseResult::PassThrough(err) => return Err(ChainError::PassThrough(err)),
            PhaseResult::Failed(err) => handle_logger_failure(tracker, hook, &call_path, err),
        }
    }

    let result = run_chain(tracker, dispatcher, hooks, idx + 1, receiver, args)?;

    if hook.logger.phases().contains(LoggerPhases::POST) {
        let (phase, elapsed) = timed(|| hook.logger.post(&env, &result, pre_value.as_ref()));
        match phase {
            PhaseResult::Ok(_) => {
                let _ = add_run_time(
                    tracker,
                    &format!("{}.{}.post", call_path, hook.logger.name()),
                    elapsed,
                );
            }
            PhaseResult::NotImplemented => {}
            PhaseResult::NoCall => {
                log::debug!(
                    target: "trackpads::dispatch",
                    "logger '{}' refused its post phase for {}",
                    hook.logger.name(),
                    call_path
                );
            }
            PhaseResult::PassThrough(err) => return Err(ChainError::PassThrough(err)),
            PhaseResult::Failed(err) => handle_logger_failure(tracker, hook, &call_path, err),
        }
    }

    Ok(result)
}

fn call_original(
    tracker: &Arc<Tracker>,
    dispatcher: &Arc<Dispatcher>,
    receiver: &Option<Receiver>,
    args: &CallArgs,
) -> TrackResult<Value> {
    let original = dispatcher.original();
    original(CallEnv {
        tracker,
        receiver: receiver.clone(),
        args,
    })
}

/// Static parameters overlaid with the event's `with` bag and the caller's
/// kwargs; collisions with caller kwargs are logged.
fn merge_params(hook: &ResolvedHook, args: &CallArgs) -> Map<String, Value> {
    let mut merged = hook.logger.static_parameters();
    for (key, value) in &hook.params {
        merged.insert(key.clone(), value.clone());
    }
    for (key, value) in &args.kwargs {
        if merged.contains_key(key) {
            log::warn!(
                target: "trackpads::dispatch",
                "caller argument '{}' overrides a hook parameter of '{}'; this may produce side effects",
                key,
                hook.logger.name()
            );
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn handle_logger_failure(
    tracker: &Arc<Tracker>,
    hook: &ResolvedHook,
    call_path: &str,
    err: TrackError,
) {
    record_logger_failure(hook.logger.name(), Some(err.code.as_str()));
    if tracker.active_run_id().is_some() {
        let _ = tracker.set_tag("pads.failure", &err.to_string());
    }
    crate::logging::with_error_code(ErrorCode::LoggerFailure, || {
        log::error!(
            target: "trackpads::dispatch",
            "tracking failed for {} in logger '{}': {}",
            call_path,
            hook.logger.name(),
            err
        );
    });
}

fn handle_chain_failure(
    tracker: &Arc<Tracker>,
    dispatcher: &Arc<Dispatcher>,
    receiver: &Option<Receiver>,
    args: &CallArgs,
    err: TrackError,
    config: &crate::config::TrackingConfig,
) -> TrackResult<Value> {
    let mut err = err;

    if config.retry_on_fail {
        // The token is minted once per top-level dispatch; a dispatch that
        // is already retrying never retries again.
        if let Some(token) = stack::begin_retry() {
            crate::logging::with_error_code(ErrorCode::TargetFailure, || {
                log::error!(
                    target: "trackpads::dispatch",
                    "tracking failed for {} (retry {}): {}; retrying pristine target",
                    dispatcher.call_path(),
                    token,
                    err
                );
            });
            record_retry(&dispatcher.call_path());
            if tracker.active_run_id().is_some() {
                let _ = tracker.set_tag("pads.retry", "true");
            }
            match call_original(tracker, dispatcher, receiver, args) {
                Ok(value) => return Ok(value),
                Err(retry_err) => err = retry_err,
            }
        }
    }

    if config.log_on_failure {
        if let Some(run_id) = tracker.active_run_id() {
            if let Some(stdout) = tracker.cache().run_get(&run_id, "stdout") {
                let _ = tracker.log_mem_artifact("stdout", &stdout, WriteFormat::Text);
            }
        }
    }

    Err(err)
}

/// Run-cache marker preventing re-entrant execution of one logger for one
/// receiver. Removed on exit, success or failure.
struct HookGuard<'a> {
    tracker: &'a Arc<Tracker>,
    run_id: Option<String>,
    key: String,
}

impl<'a> HookGuard<'a> {
    fn enter(tracker: &'a Arc<Tracker>, identity: u64, logger: &str) -> Option<Self> {
        let key = format!("active_calls/{}/{}", identity, logger);
        let run_id = tracker.active_run_id();
        let cache = tracker.cache();
        let already_active = match run_id.as_deref() {
            Some(run_id) => cache.run_exists(run_id, &key),
            None => cache.exists(&key),
        };
        if already_active {
            return None;
        }
        match run_id.as_deref() {
            Some(run_id) => cache.run_add(run_id, &key, json!(true)),
            None => cache.add(&key, json!(true)),
        }
        Some(Self {
            tracker,
            run_id,
            key,
        })
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        let cache = self.tracker.cache();
        match self.run_id.as_deref() {
            Some(run_id) => {
                cache.run_pop(run_id, &self.key);
            }
            None => {
                cache.pop(&self.key);
            }
        }
    }
}
