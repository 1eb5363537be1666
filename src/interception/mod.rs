//! Module-load interception.
//!
//! Registration of a module blueprint is the load event. After the module's
//! definitions land in the target registry the interceptor runs two passes
//! until they settle: inheritance propagation (classes whose ancestor order
//! reaches an already-wrapped class inherit its mapping) and direct
//! matching (mapping references resolving into this module are wrapped in
//! place). Modules registered before activation are re-walked on
//! activation unless they belong to the important set.

use std::sync::Arc;

use crate::session::Tracker;
use crate::targets::{linearize, ModuleDef, Resolved};
use crate::wrapping;

const IMPORTANT_MODULES_ENV: &str = "PADS_IMPORTANT_MODULES";

/// Modules that are never re-walked on activation: the runtime itself and
/// infrastructure whose rewrapping could destabilize the process.
pub fn default_important_modules() -> Vec<String> {
    let mut modules: Vec<String> = [
        "std", "core", "alloc", "trackpads", "serde", "serde_json", "log", "uuid",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if let Ok(raw) = std::env::var(IMPORTANT_MODULES_ENV) {
        modules.extend(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    modules
}

/// True when `name` belongs to the important set.
pub fn is_important_module(name: &str, important: &[String]) -> bool {
    name.starts_with('_')
        || important
            .iter()
            .any(|module| name == module || name.starts_with(&format!("{}.", module)))
}

/// Install interception and walk modules that registered before activation.
pub(crate) fn activate(tracker: &Arc<Tracker>) {
    if tracker.mark_tracking_active() {
        return;
    }

    let roots = tracker.mappings().root_modules();
    for name in tracker.targets().module_names() {
        let root = name.split('.').next().unwrap_or(&name);
        if !roots.contains(root) {
            continue;
        }
        if is_important_module(&name, tracker.important_modules()) {
            continue;
        }
        log::warn!(
            target: "trackpads::interception",
            "'{}' was registered before tracking was activated; wrapping retroactively, \
             already-created instances are not tracked",
            name
        );
        if let Some(module) = tracker.targets().module(&name) {
            on_module_registered(tracker, &module);
        }
    }
}

/// The decorated module-execute step: runs after a module's definitions
/// are installed.
pub(crate) fn on_module_registered(tracker: &Arc<Tracker>, module: &Arc<ModuleDef>) {
    // Propagation can discover mappings that direct matching then wraps,
    // and a directly wrapped class can unlock propagation for intra-module
    // subclasses. Iterate to a fixpoint; each pass only ever adds wraps,
    // so this terminates.
    loop {
        let propagated = propagate_inheritance(tracker, module);
        let matched = match_direct(tracker, module);
        if !propagated && !matched {
            break;
        }
    }
}

/// Walk each class of the module; classes overlapping an already-wrapped
/// ancestor inherit the nearest ancestor's mapping.
fn propagate_inheritance(tracker: &Arc<Tracker>, module: &Arc<ModuleDef>) -> bool {
    let mut changed = false;
    for class in tracker.targets().classes_in_module(module.name()) {
        if class.wrap_state().is_wrapped() {
            continue;
        }
        // Nearest wrapped ancestor wins; linearization order is nearest
        // first.
        for ancestor in linearize(&class).into_iter().skip(1) {
            if !ancestor.wrap_state().is_wrapped() {
                continue;
            }
            let Some(ancestor_mapping) = ancestor.wrap_state().container_mapping() else {
                continue;
            };
            match ancestor_mapping.inherit_for(&class.path()) {
                Ok(inherited) => {
                    if tracker.mappings().add_found_class(inherited) {
                        changed = true;
                    }
                }
                Err(err) => {
                    log::debug!(
                        target: "trackpads::interception",
                        "skipping inherited mapping for '{}': {}",
                        class.path(),
                        err
                    );
                }
            }
            break;
        }
    }
    changed
}

/// Wrap every known mapping whose reference lands inside this module.
fn match_direct(tracker: &Arc<Tracker>, module: &Arc<ModuleDef>) -> bool {
    let module_name = module.name();
    let prefix = format!("{}.", module_name);
    let mut changed = false;

    for mapping in tracker.mappings().get_relevant_mappings() {
        if mapping.reference != module_name && !mapping.reference.starts_with(&prefix) {
            continue;
        }
        let Some(resolved) = tracker.targets().resolve(&mapping.reference) else {
            log::debug!(
                target: "trackpads::interception",
                "mapping reference '{}' does not resolve in '{}'",
                mapping.reference,
                module_name
            );
            continue;
        };

        let was_wrapped = match &resolved {
            Resolved::Module(m) => m.wrap_state().is_wrapped(),
            Resolved::Class(c) => c.wrap_state().is_wrapped(),
            Resolved::Member(container, member) => container
                .members()
                .get(member)
                .map(|slot| slot.target.is_wrapped())
                .unwrap_or(false),
        };
        if was_wrapped {
            continue;
        }

        wrapping::wrap(&resolved, &mapping);

        let now_wrapped = match &resolved {
            Resolved::Module(m) => m.wrap_state().is_wrapped(),
            Resolved::Class(c) => c.wrap_state().is_wrapped(),
            Resolved::Member(container, member) => container
                .members()
                .get(member)
                .map(|slot| slot.target.is_wrapped())
                .unwrap_or(false),
        };
        if now_wrapped {
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn important_set_matches_prefixes_and_private_names() {
        let important = vec!["std".to_string(), "trackpads".to_string()];
        assert!(is_important_module("std", &important));
        assert!(is_important_module("std.collections", &important));
        assert!(is_important_module("_hidden", &important));
        assert!(!is_important_module("sklearn", &important));
        assert!(!is_important_module("stdlib_like", &important));
    }

    #[test]
    fn default_important_modules_cover_the_runtime() {
        let modules = default_important_modules();
        assert!(modules.iter().any(|m| m == "trackpads"));
        assert!(modules.iter().any(|m| m == "std"));
    }
}
