//! Class definitions, instances and ancestor linearization.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::mapping::TargetMapping;
use crate::targets::callable::{CallShape, NativeFn};
use crate::targets::module::{MemberBlueprint, MemberSlot};

/// Wrap bookkeeping shared by modules and classes: the sentinel, the
/// shadowed originals and the per-member mapping records.
#[derive(Default)]
pub struct WrapState {
    wrapped: AtomicBool,
    sealed: bool,
    shadows: DashMap<String, NativeFn>,
    member_mappings: DashMap<String, Arc<TargetMapping>>,
    container_mapping: RwLock<Option<Arc<TargetMapping>>>,
}

impl WrapState {
    pub(crate) fn new(sealed: bool) -> Self {
        Self {
            sealed,
            ..Self::default()
        }
    }

    /// Containers that refuse attribute assignment cannot be wrapped.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped.load(Ordering::Acquire)
    }

    pub fn mark_wrapped(&self) {
        self.wrapped.store(true, Ordering::Release);
    }

    /// Record the pristine target under its shadow key. The first record
    /// for a key wins so overlapping wrappings recover the true original.
    pub fn record_shadow(&self, key: String, original: NativeFn) {
        self.shadows.entry(key).or_insert(original);
    }

    pub fn shadow(&self, key: &str) -> Option<NativeFn> {
        self.shadows.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_shadow(&self, key: &str) -> bool {
        self.shadows.contains_key(key)
    }

    pub fn record_member_mapping(&self, member: &str, mapping: Arc<TargetMapping>) {
        self.member_mappings.insert(member.to_string(), mapping);
    }

    pub fn member_mapping(&self, member: &str) -> Option<Arc<TargetMapping>> {
        self.member_mappings
            .get(member)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn set_container_mapping(&self, mapping: Arc<TargetMapping>) {
        *self
            .container_mapping
            .write()
            .expect("container mapping lock") = Some(mapping);
    }

    pub fn container_mapping(&self) -> Option<Arc<TargetMapping>> {
        self.container_mapping
            .read()
            .expect("container mapping lock")
            .clone()
    }
}

/// A registered class: members, base classes, wrap bookkeeping.
pub struct ClassDef {
    id: u64,
    name: String,
    module: String,
    bases: Vec<Arc<ClassDef>>,
    members: DashMap<String, MemberSlot>,
    wrap_state: WrapState,
}

impl ClassDef {
    pub(crate) fn new(
        id: u64,
        name: String,
        module: String,
        bases: Vec<Arc<ClassDef>>,
        members: DashMap<String, MemberSlot>,
        sealed: bool,
    ) -> Self {
        Self {
            id,
            name,
            module,
            bases,
            members,
            wrap_state: WrapState::new(sealed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Dotted path `module.Class`.
    pub fn path(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn bases(&self) -> &[Arc<ClassDef>] {
        &self.bases
    }

    pub fn members(&self) -> &DashMap<String, MemberSlot> {
        &self.members
    }

    pub fn wrap_state(&self) -> &WrapState {
        &self.wrap_state
    }

    /// Find the class in the ancestor order that defines `member`, along
    /// with the slot itself.
    pub fn resolve_member(self: &Arc<Self>, member: &str) -> Option<(Arc<ClassDef>, MemberSlot)> {
        for class in linearize(self) {
            let found = class.members.get(member).map(|slot| slot.value().clone());
            if let Some(slot) = found {
                return Some((class, slot));
            }
        }
        None
    }
}

impl std::fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClassDef({})", self.path())
    }
}

/// Ancestor order of a class: the class itself, then bases depth-first,
/// first occurrence kept.
pub fn linearize(class: &Arc<ClassDef>) -> Vec<Arc<ClassDef>> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    fn walk(class: &Arc<ClassDef>, seen: &mut HashSet<u64>, order: &mut Vec<Arc<ClassDef>>) {
        if !seen.insert(class.id()) {
            return;
        }
        order.push(Arc::clone(class));
        for base in class.bases() {
            walk(base, seen, order);
        }
    }
    walk(class, &mut seen, &mut order);
    order
}

/// A live object of a registered class.
pub struct Instance {
    id: u64,
    class: Arc<ClassDef>,
    fields: RwLock<Map<String, Value>>,
}

impl Instance {
    pub(crate) fn new(id: u64, class: Arc<ClassDef>) -> Self {
        Self {
            id,
            class,
            fields: RwLock::new(Map::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.read().expect("instance fields lock").get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.fields
            .write()
            .expect("instance fields lock")
            .insert(name.to_string(), value);
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields
            .read()
            .expect("instance fields lock")
            .contains_key(name)
    }
}

/// Declarative description of a class before registration.
pub struct ClassBlueprint {
    pub(crate) name: String,
    pub(crate) bases: Vec<String>,
    pub(crate) members: Vec<MemberBlueprint>,
    pub(crate) sealed: bool,
}

impl ClassBlueprint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bases: Vec::new(),
            members: Vec::new(),
            sealed: false,
        }
    }

    /// Declare a base class by dotted path (`module.Class`). Bases must be
    /// registered before this blueprint is installed.
    pub fn base(mut self, path: &str) -> Self {
        self.bases.push(path.to_string());
        self
    }

    pub fn init(mut self, f: NativeFn) -> Self {
        self.members
            .push(MemberBlueprint::new("init", CallShape::Init, f));
        self
    }

    pub fn method(mut self, name: &str, f: NativeFn) -> Self {
        self.members
            .push(MemberBlueprint::new(name, CallShape::Method, f));
        self
    }

    pub fn class_method(mut self, name: &str, f: NativeFn) -> Self {
        self.members
            .push(MemberBlueprint::new(name, CallShape::Class, f));
        self
    }

    pub fn static_method(mut self, name: &str, f: NativeFn) -> Self {
        self.members
            .push(MemberBlueprint::new(name, CallShape::Static, f));
        self
    }

    pub fn property_getter(mut self, name: &str, f: NativeFn) -> Self {
        self.members
            .push(MemberBlueprint::new(name, CallShape::Property, f));
        self
    }

    /// A descriptor member gated on the presence of `guard_field` on the
    /// receiver, resolved before any wrapper runs.
    pub fn descriptor(mut self, name: &str, guard_field: &str, f: NativeFn) -> Self {
        self.members.push(
            MemberBlueprint::new(name, CallShape::Descriptor, f).with_guard(guard_field),
        );
        self
    }

    /// Mark the class as refusing member substitution.
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{ModuleBlueprint, TargetRegistry};
    use serde_json::Value;

    fn noop() -> NativeFn {
        Arc::new(|_env| Ok(Value::Null))
    }

    fn diamond_registry() -> TargetRegistry {
        let registry = TargetRegistry::new();
        registry
            .register_module(
                ModuleBlueprint::new("lib.shapes")
                    .class(ClassBlueprint::new("Top").method("area", noop()))
                    .class(ClassBlueprint::new("Left").base("lib.shapes.Top"))
                    .class(ClassBlueprint::new("Right").base("lib.shapes.Top"))
                    .class(
                        ClassBlueprint::new("Bottom")
                            .base("lib.shapes.Left")
                            .base("lib.shapes.Right"),
                    ),
            )
            .expect("register shapes");
        registry
    }

    #[test]
    fn linearization_visits_each_ancestor_once() {
        let registry = diamond_registry();
        let bottom = registry.class("lib.shapes.Bottom").expect("Bottom");
        let order: Vec<String> = linearize(&bottom).iter().map(|c| c.path()).collect();
        assert_eq!(
            order,
            vec![
                "lib.shapes.Bottom",
                "lib.shapes.Left",
                "lib.shapes.Top",
                "lib.shapes.Right"
            ]
        );
    }

    #[test]
    fn member_resolution_walks_ancestors() {
        let registry = diamond_registry();
        let bottom = registry.class("lib.shapes.Bottom").expect("Bottom");
        let (owner, slot) = bottom.resolve_member("area").expect("resolve area");
        assert_eq!(owner.path(), "lib.shapes.Top");
        assert_eq!(slot.shape, CallShape::Method);
        assert!(bottom.resolve_member("missing").is_none());
    }

    #[test]
    fn shadow_records_keep_first() {
        let state = WrapState::new(false);
        let first: NativeFn = Arc::new(|_env| Ok(Value::from(1)));
        let second: NativeFn = Arc::new(|_env| Ok(Value::from(2)));
        state.record_shadow("_original_1_fit".to_string(), first);
        state.record_shadow("_original_1_fit".to_string(), second);

        let recovered = state.shadow("_original_1_fit").expect("shadow present");
        let env_args = crate::targets::CallArgs::none();
        let tracker = crate::session::Tracker::for_tests();
        let value = recovered(crate::targets::CallEnv {
            tracker: &tracker,
            receiver: None,
            args: &env_args,
        })
        .expect("call shadow");
        assert_eq!(value, Value::from(1));
    }
}
