//! Per-thread call records for nested dispatches.
//!
//! Every dispatch pushes a record before anything else and pops it on all
//! exit paths. Recursion cut-offs and retry bookkeeping read the stack;
//! nothing else does. The stack is thread-local by design: concurrent
//! dispatches never observe each other.

use std::cell::RefCell;
use std::sync::Arc;

use uuid::Uuid;

use crate::mapping::TargetMapping;
use crate::targets::ContainerRef;

/// One in-flight dispatch on this thread.
#[derive(Clone)]
pub struct CallRecord {
    pub mapping: Arc<TargetMapping>,
    pub container_id: u64,
    pub member: String,
    pub receiver_identity: Option<u64>,
    /// Fresh token minted on entry; retry recurrence compares against it.
    pub retry_token: Uuid,
    /// Set once the failure policy started retrying this dispatch.
    pub retrying: bool,
}

thread_local! {
    static CALL_STACK: RefCell<Vec<CallRecord>> = RefCell::new(Vec::new());
}

/// Depth of the current thread's dispatch nesting.
pub fn call_depth() -> usize {
    CALL_STACK.with(|stack| stack.borrow().len())
}

/// Push a record and return a guard that pops it when dropped.
pub(crate) fn push(
    mapping: &Arc<TargetMapping>,
    container: &ContainerRef,
    member: &str,
    receiver_identity: Option<u64>,
) -> StackGuard {
    let record = CallRecord {
        mapping: Arc::clone(mapping),
        container_id: container.id(),
        member: member.to_string(),
        receiver_identity,
        retry_token: Uuid::new_v4(),
        retrying: false,
    };
    CALL_STACK.with(|stack| stack.borrow_mut().push(record));
    StackGuard
}

/// True when `receiver` already appears below the top of the stack for the
/// same target member.
pub(crate) fn receiver_already_deeper(container_id: u64, member: &str, receiver: u64) -> bool {
    CALL_STACK.with(|stack| {
        let stack = stack.borrow();
        let Some((_top, below)) = stack.split_last() else {
            return false;
        };
        below.iter().any(|record| {
            record.container_id == container_id
                && record.member == member
                && record.receiver_identity == Some(receiver)
        })
    })
}

/// Mark the current top-of-stack dispatch as retrying. Returns the retry
/// token the first time; `None` when a retry is already in flight.
pub(crate) fn begin_retry() -> Option<Uuid> {
    CALL_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let record = stack.last_mut()?;
        if record.retrying {
            None
        } else {
            record.retrying = true;
            Some(record.retry_token)
        }
    })
}

pub(crate) struct StackGuard;

impl Drop for StackGuard {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DefaultHooks;
    use crate::targets::{ModuleBlueprint, TargetRegistry};

    fn mapping() -> Arc<TargetMapping> {
        Arc::new(TargetMapping {
            reference: "lib.mod.f".to_string(),
            library: "lib".to_string(),
            library_version: "1.0".to_string(),
            algorithm: "f".to_string(),
            hooks: Vec::new(),
            default_hooks: Arc::new(DefaultHooks::default()),
            source: None,
            inherited_from: None,
        })
    }

    fn container() -> ContainerRef {
        let registry = TargetRegistry::new();
        let module = registry
            .register_module(ModuleBlueprint::new("lib.mod"))
            .expect("register");
        ContainerRef::Module(module)
    }

    #[test]
    fn guard_pops_on_drop() {
        let mapping = mapping();
        let container = container();
        assert_eq!(call_depth(), 0);
        {
            let _outer = push(&mapping, &container, "f", None);
            assert_eq!(call_depth(), 1);
            {
                let _inner = push(&mapping, &container, "f", None);
                assert_eq!(call_depth(), 2);
            }
            assert_eq!(call_depth(), 1);
        }
        assert_eq!(call_depth(), 0);
    }

    #[test]
    fn receiver_identity_check_ignores_the_top_record() {
        let mapping = mapping();
        let container = container();
        let id = container.id();

        let _outer = push(&mapping, &container, "fit", Some(7));
        // The receiver of the current call alone is not recursion.
        assert!(!receiver_already_deeper(id, "fit", 7));

        let _inner = push(&mapping, &container, "fit", Some(7));
        assert!(receiver_already_deeper(id, "fit", 7));
        assert!(!receiver_already_deeper(id, "fit", 8));
        assert!(!receiver_already_deeper(id, "predict", 7));
    }

    #[test]
    fn retry_begins_once() {
        let mapping = mapping();
        let container = container();
        let _guard = push(&mapping, &container, "f", None);
        let first = begin_retry();
        assert!(first.is_some());
        assert!(begin_retry().is_none());
    }
}
