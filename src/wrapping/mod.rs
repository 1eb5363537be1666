//! Wrapping engine: installs dispatchers over registered targets.
//!
//! For every wrapped member the engine records on the container: the
//! pristine target under a shadow key derived from the container identity
//! and the member name, the mapping that caused the wrap, and a sentinel
//! marking the container as wrapped. Rewrapping the same member is a no-op
//! that returns the existing dispatcher.

use std::sync::Arc;

use crate::mapping::{Granularity, TargetMapping};
use crate::targets::{
    CallShape, ContainerRef, MemberSlot, ModuleDef, NativeFn, Resolved, SlotTarget,
};
use crate::targets::ClassDef;

/// The callable installed in place of a tracked target. Captures what the
/// chain needs at call time; the hook list itself is re-evaluated per call
/// because the configuration is run-scoped.
pub struct Dispatcher {
    mapping: Arc<TargetMapping>,
    container: ContainerRef,
    member: String,
    shape: CallShape,
    granularity: Granularity,
    original: NativeFn,
}

impl Dispatcher {
    pub fn mapping(&self) -> &Arc<TargetMapping> {
        &self.mapping
    }

    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The pristine target recovered for retries and unwrap checks.
    pub fn original(&self) -> NativeFn {
        Arc::clone(&self.original)
    }

    /// Stable key for per-call timings.
    pub fn call_path(&self) -> String {
        format!("{}.{}", self.container.path(), self.member)
    }
}

/// Shadow key under which the pristine target of `member` is preserved on
/// `container`. Includes the container identity so a method defined on a
/// base class and wrapped through a subclass does not clobber the base's
/// original.
pub fn shadow_key(container: &ContainerRef, member: &str) -> String {
    format!("_original_{}_{}", container.id(), member)
}

/// Wrap whatever `resolved` points at.
pub fn wrap(resolved: &Resolved, mapping: &Arc<TargetMapping>) {
    match resolved {
        Resolved::Module(module) => wrap_module(module, mapping),
        Resolved::Class(class) => wrap_class(class, mapping),
        Resolved::Member(container, member) => {
            let granularity = match container {
                ContainerRef::Module(_) => Granularity::Function,
                ContainerRef::Class(_) => Granularity::Class,
            };
            wrap_function(container, member, mapping, granularity);
        }
    }
}

/// Wrap every member of a module against the mapping's default module
/// hooks. Idempotent via the module sentinel.
pub fn wrap_module(module: &Arc<ModuleDef>, mapping: &Arc<TargetMapping>) {
    let state = module.wrap_state();
    if state.is_wrapped() {
        return;
    }
    if state.is_sealed() {
        log::debug!(
            target: "trackpads::wrapping",
            "module '{}' refuses member substitution; omit wrapping",
            module.name()
        );
        return;
    }

    let container = ContainerRef::Module(Arc::clone(module));
    let members: Vec<String> = module.members().iter().map(|e| e.key().clone()).collect();
    for member in members {
        wrap_function(&container, &member, mapping, Granularity::Module);
    }
    state.set_container_mapping(Arc::clone(mapping));
    state.mark_wrapped();
}

/// Wrap the hook-applicable members of a class. Idempotent via the class
/// sentinel; sealed classes are skipped with a debug note.
pub fn wrap_class(class: &Arc<ClassDef>, mapping: &Arc<TargetMapping>) {
    let state = class.wrap_state();
    if state.is_wrapped() {
        return;
    }
    if state.is_sealed() {
        log::debug!(
            target: "trackpads::wrapping",
            "class '{}' refuses member substitution; omit wrapping",
            class.path()
        );
        return;
    }

    state.set_container_mapping(Arc::clone(mapping));
    let container = ContainerRef::Class(Arc::clone(class));

    let hooks = mapping.effective_hooks(Granularity::Class);
    let mut members: Vec<String> = Vec::new();
    for entry in class.members().iter() {
        if hooks.iter().any(|hook| hook.is_applicable(entry.key())) {
            members.push(entry.key().clone());
        }
    }
    // Members inherited from ancestors are wrapped on this class so the
    // ancestor's slot stays pristine.
    for ancestor in crate::targets::linearize(class).iter().skip(1) {
        for entry in ancestor.members().iter() {
            if class.members().contains_key(entry.key()) || members.contains(entry.key()) {
                continue;
            }
            if hooks.iter().any(|hook| hook.is_applicable(entry.key())) {
                class.members().insert(entry.key().clone(), entry.value().clone());
                members.push(entry.key().clone());
            }
        }
    }

    for member in members {
        wrap_function(&container, &member, mapping, Granularity::Class);
    }
    state.mark_wrapped();
}

/// Wrap a single member of a container. Returns the dispatcher in place
/// after the call, or `None` when wrapping was impossible.
pub fn wrap_function(
    container: &ContainerRef,
    member: &str,
    mapping: &Arc<TargetMapping>,
    granularity: Granularity,
) -> Option<Arc<Dispatcher>> {
    let state = container.wrap_state();
    if state.is_sealed() {
        log::debug!(
            target: "trackpads::wrapping",
            "can't substitute '{}' on '{}'; omit wrapping",
            member,
            container.path()
        );
        return None;
    }

    // The member may live on an ancestor for class containers.
    let slot = match container.members().get(member) {
        Some(entry) => entry.value().clone(),
        None => match container {
            ContainerRef::Class(class) => {
                let (_, slot) = class.resolve_member(member)?;
                slot
            }
            ContainerRef::Module(_) => {
                log::warn!(
                    target: "trackpads::wrapping",
                    "can't access member '{}' on '{}'; skipping",
                    member,
                    container.path()
                );
                return None;
            }
        },
    };

    let key = shadow_key(container, member);
    if let SlotTarget::Wrapped(existing) = &slot.target {
        if state.has_shadow(&key) {
            // Already wrapped under this container; rewrap is a no-op.
            return Some(Arc::clone(existing));
        }
    }

    // Recover the pristine target even if the slot holds a dispatcher
    // installed through another container.
    let original = slot.target.original();
    state.record_shadow(key, Arc::clone(&original));
    state.record_member_mapping(member, Arc::clone(mapping));

    let dispatcher = Arc::new(Dispatcher {
        mapping: Arc::clone(mapping),
        container: container.clone(),
        member: member.to_string(),
        shape: slot.shape,
        granularity,
        original,
    });

    container.members().insert(
        member.to_string(),
        MemberSlot {
            shape: slot.shape,
            guard: slot.guard.clone(),
            target: SlotTarget::Wrapped(Arc::clone(&dispatcher)),
        },
    );
    state.mark_wrapped();
    Some(dispatcher)
}
