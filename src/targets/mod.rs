//! The explicit target registry.
//!
//! Tracked libraries cannot be patched in place in a compiled program, so
//! integrations register *blueprints* of their modules here: functions,
//! classes with base lists, and members of each callable shape. Call sites
//! resolve targets through the registry, which is what lets the wrapping
//! engine interpose a dispatcher by swapping a member slot.

mod callable;
mod class;
mod module;

pub use callable::{CallArgs, CallEnv, CallShape, NativeFn, Receiver, SlotTarget};
pub use class::{linearize, ClassBlueprint, ClassDef, Instance, WrapState};
pub use module::{MemberBlueprint, MemberSlot, ModuleBlueprint, ModuleDef};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use trackpads_errors::{usage, ErrorCode, TrackResult};

/// A module or class owning tracked members.
#[derive(Clone)]
pub enum ContainerRef {
    Module(Arc<ModuleDef>),
    Class(Arc<ClassDef>),
}

impl ContainerRef {
    /// Stable container identity used in shadow keys.
    pub fn id(&self) -> u64 {
        match self {
            ContainerRef::Module(module) => module.id(),
            ContainerRef::Class(class) => class.id(),
        }
    }

    /// Dotted path of the container.
    pub fn path(&self) -> String {
        match self {
            ContainerRef::Module(module) => module.name().to_string(),
            ContainerRef::Class(class) => class.path(),
        }
    }

    pub fn members(&self) -> &DashMap<String, MemberSlot> {
        match self {
            ContainerRef::Module(module) => module.members(),
            ContainerRef::Class(class) => class.members(),
        }
    }

    pub fn wrap_state(&self) -> &WrapState {
        match self {
            ContainerRef::Module(module) => module.wrap_state(),
            ContainerRef::Class(class) => class.wrap_state(),
        }
    }
}

impl std::fmt::Debug for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContainerRef({})", self.path())
    }
}

/// Outcome of resolving a dotted reference against the registry.
#[derive(Clone, Debug)]
pub enum Resolved {
    Module(Arc<ModuleDef>),
    Class(Arc<ClassDef>),
    /// A member of a module or class, not yet bound to a receiver.
    Member(ContainerRef, String),
}

/// Registry of everything that can be tracked.
pub struct TargetRegistry {
    modules: DashMap<String, Arc<ModuleDef>>,
    classes: DashMap<String, Arc<ClassDef>>,
    next_container_id: AtomicU64,
    next_instance_id: AtomicU64,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
            classes: DashMap::new(),
            next_container_id: AtomicU64::new(1),
            next_instance_id: AtomicU64::new(1),
        }
    }

    /// Install a module blueprint. Base classes must resolve against
    /// already-registered classes or classes earlier in the same blueprint.
    pub fn register_module(&self, blueprint: ModuleBlueprint) -> TrackResult<Arc<ModuleDef>> {
        if self.modules.contains_key(blueprint.name()) {
            return Err(usage!(
                ErrorCode::AlreadyActive,
                "module '{}' is already registered",
                blueprint.name()
            ));
        }

        let module = module::build_module(self, blueprint)?;
        self.modules
            .insert(module.name().to_string(), Arc::clone(&module));
        Ok(module)
    }

    pub(crate) fn next_container_id(&self) -> u64 {
        self.next_container_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_class(&self, class: Arc<ClassDef>) {
        self.classes.insert(class.path(), class);
    }

    /// Create a fresh, unconstructed instance of `class`.
    pub fn new_instance(&self, class: &Arc<ClassDef>) -> Arc<Instance> {
        Arc::new(Instance::new(
            self.next_instance_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(class),
        ))
    }

    pub fn module(&self, name: &str) -> Option<Arc<ModuleDef>> {
        self.modules.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn class(&self, path: &str) -> Option<Arc<ClassDef>> {
        self.classes.get(path).map(|entry| Arc::clone(entry.value()))
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn classes(&self) -> Vec<Arc<ClassDef>> {
        self.classes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn classes_in_module(&self, module: &str) -> Vec<Arc<ClassDef>> {
        self.classes
            .iter()
            .filter(|entry| entry.value().module() == module)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Resolve a dotted reference by locating the longest module prefix and
    /// descending attribute-by-attribute along the remainder.
    pub fn resolve(&self, reference: &str) -> Option<Resolved> {
        let segments: Vec<&str> = reference.split('.').collect();

        // Longest module prefix wins.
        for prefix_len in (1..=segments.len()).rev() {
            let prefix = segments[..prefix_len].join(".");
            let Some(module) = self.module(&prefix) else {
                continue;
            };
            let rest = &segments[prefix_len..];
            return self.descend(module, rest);
        }
        None
    }

    fn descend(&self, module: Arc<ModuleDef>, rest: &[&str]) -> Option<Resolved> {
        match rest {
            [] => Some(Resolved::Module(module)),
            [name] => {
                let class_path = format!("{}.{}", module.name(), name);
                if let Some(class) = self.class(&class_path) {
                    return Some(Resolved::Class(class));
                }
                if module.members().contains_key(*name) {
                    return Some(Resolved::Member(ContainerRef::Module(module), name.to_string()));
                }
                None
            }
            [class_name, member] => {
                let class_path = format!("{}.{}", module.name(), class_name);
                let class = self.class(&class_path)?;
                // Members may live on an ancestor; resolution follows the
                // linearized order.
                if class.resolve_member(member).is_some() {
                    Some(Resolved::Member(
                        ContainerRef::Class(class),
                        member.to_string(),
                    ))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> NativeFn {
        Arc::new(|_env| Ok(serde_json::Value::Null))
    }

    fn sample_registry() -> TargetRegistry {
        let registry = TargetRegistry::new();
        registry
            .register_module(
                ModuleBlueprint::new("lib.mod")
                    .function("f", noop())
                    .class(
                        ClassBlueprint::new("Base")
                            .init(noop())
                            .method("fit", noop()),
                    ),
            )
            .expect("register lib.mod");
        registry
    }

    #[test]
    fn resolves_module_class_and_members() {
        let registry = sample_registry();
        assert!(matches!(
            registry.resolve("lib.mod"),
            Some(Resolved::Module(_))
        ));
        assert!(matches!(
            registry.resolve("lib.mod.Base"),
            Some(Resolved::Class(_))
        ));
        assert!(matches!(
            registry.resolve("lib.mod.f"),
            Some(Resolved::Member(ContainerRef::Module(_), _))
        ));
        assert!(matches!(
            registry.resolve("lib.mod.Base.fit"),
            Some(Resolved::Member(ContainerRef::Class(_), _))
        ));
        assert!(registry.resolve("lib.mod.missing").is_none());
        assert!(registry.resolve("other.mod").is_none());
    }

    #[test]
    fn duplicate_module_registration_fails() {
        let registry = sample_registry();
        let err = registry
            .register_module(ModuleBlueprint::new("lib.mod"))
            .expect_err("duplicate registration");
        assert_eq!(err.code, ErrorCode::AlreadyActive);
    }

    #[test]
    fn instances_get_distinct_identities() {
        let registry = sample_registry();
        let class = registry.class("lib.mod.Base").expect("class");
        let a = registry.new_instance(&class);
        let b = registry.new_instance(&class);
        assert_ne!(a.id(), b.id());
        a.set_field("trained", json!(true));
        assert_eq!(a.get_field("trained"), Some(json!(true)));
        assert_eq!(b.get_field("trained"), None);
    }

    #[test]
    fn container_ids_are_unique_across_kinds() {
        let registry = sample_registry();
        let module = registry.module("lib.mod").expect("module");
        let class = registry.class("lib.mod.Base").expect("class");
        assert_ne!(module.id(), class.id());
    }
}
