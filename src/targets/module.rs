//! Module definitions and registration blueprints.

use std::sync::Arc;

use dashmap::DashMap;
use trackpads_errors::{usage, ErrorCode, TrackResult};

use crate::targets::callable::{CallShape, NativeFn, SlotTarget};
use crate::targets::class::{ClassBlueprint, ClassDef, WrapState};
use crate::targets::TargetRegistry;

/// One entry in a container's member table.
#[derive(Clone)]
pub struct MemberSlot {
    pub shape: CallShape,
    /// Field that must exist on the receiver for descriptor members.
    pub guard: Option<String>,
    pub target: SlotTarget,
}

impl MemberSlot {
    pub fn native(shape: CallShape, guard: Option<String>, f: NativeFn) -> Self {
        Self {
            shape,
            guard,
            target: SlotTarget::Native(f),
        }
    }
}

/// A registered module: free functions plus wrap bookkeeping. Classes are
/// registered alongside and indexed by the registry.
pub struct ModuleDef {
    id: u64,
    name: String,
    members: DashMap<String, MemberSlot>,
    wrap_state: WrapState,
}

impl ModuleDef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &DashMap<String, MemberSlot> {
        &self.members
    }

    pub fn wrap_state(&self) -> &WrapState {
        &self.wrap_state
    }
}

impl std::fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModuleDef({})", self.name)
    }
}

/// One member of a class or module blueprint.
pub struct MemberBlueprint {
    pub(crate) name: String,
    pub(crate) shape: CallShape,
    pub(crate) guard: Option<String>,
    pub(crate) f: NativeFn,
}

impl MemberBlueprint {
    pub fn new(name: &str, shape: CallShape, f: NativeFn) -> Self {
        Self {
            name: name.to_string(),
            shape,
            guard: None,
            f,
        }
    }

    pub(crate) fn with_guard(mut self, guard_field: &str) -> Self {
        self.guard = Some(guard_field.to_string());
        self
    }
}

/// Declarative description of a module before registration.
pub struct ModuleBlueprint {
    name: String,
    functions: Vec<MemberBlueprint>,
    classes: Vec<ClassBlueprint>,
    sealed: bool,
}

impl ModuleBlueprint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
            classes: Vec::new(),
            sealed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a free function.
    pub fn function(mut self, name: &str, f: NativeFn) -> Self {
        self.functions
            .push(MemberBlueprint::new(name, CallShape::Free, f));
        self
    }

    pub fn class(mut self, class: ClassBlueprint) -> Self {
        self.classes.push(class);
        self
    }

    /// Mark the module as refusing member substitution.
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }
}

/// Materialize a blueprint into the registry. Classes resolve their bases
/// against already-registered classes, including earlier classes of the
/// same blueprint, in declaration order.
pub(crate) fn build_module(
    registry: &TargetRegistry,
    blueprint: ModuleBlueprint,
) -> TrackResult<Arc<ModuleDef>> {
    let members = DashMap::new();
    for function in blueprint.functions {
        if function.shape != CallShape::Free {
            return Err(usage!(
                ErrorCode::InvalidMapping,
                "module member '{}.{}' must be a free function",
                blueprint.name,
                function.name
            ));
        }
        members.insert(
            function.name.clone(),
            MemberSlot::native(function.shape, function.guard, function.f),
        );
    }

    let module = Arc::new(ModuleDef {
        id: registry.next_container_id(),
        name: blueprint.name.clone(),
        members,
        wrap_state: WrapState::new(blueprint.sealed),
    });

    for class in blueprint.classes {
        let mut bases = Vec::with_capacity(class.bases.len());
        for base_path in &class.bases {
            let base = registry.class(base_path).ok_or_else(|| {
                usage!(
                    ErrorCode::UnknownTarget,
                    "base class '{}' of '{}.{}' is not registered",
                    base_path,
                    blueprint.name,
                    class.name
                )
            })?;
            bases.push(base);
        }

        let class_members = DashMap::new();
        for member in class.members {
            class_members.insert(
                member.name.clone(),
                MemberSlot::native(member.shape, member.guard, member.f),
            );
        }

        let class_def = Arc::new(ClassDef::new(
            registry.next_container_id(),
            class.name,
            blueprint.name.clone(),
            bases,
            class_members,
            class.sealed,
        ));
        registry.register_class(class_def);
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn noop() -> NativeFn {
        Arc::new(|_env| Ok(Value::Null))
    }

    #[test]
    fn unknown_base_is_rejected() {
        let registry = TargetRegistry::new();
        let err = registry
            .register_module(
                ModuleBlueprint::new("lib.broken")
                    .class(ClassBlueprint::new("Child").base("lib.missing.Base")),
            )
            .expect_err("unknown base");
        assert_eq!(err.code, ErrorCode::UnknownTarget);
    }

    #[test]
    fn same_blueprint_bases_resolve_in_order() {
        let registry = TargetRegistry::new();
        registry
            .register_module(
                ModuleBlueprint::new("lib.a")
                    .class(ClassBlueprint::new("Base").method("fit", noop()))
                    .class(ClassBlueprint::new("Child").base("lib.a.Base")),
            )
            .expect("register");
        let child = registry.class("lib.a.Child").expect("child");
        assert_eq!(child.bases().len(), 1);
        assert_eq!(child.bases()[0].path(), "lib.a.Base");
    }
}
