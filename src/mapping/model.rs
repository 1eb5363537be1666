//! Mapping data models (documents, algorithms, resolved target mappings).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use trackpads_errors::{usage, ErrorCode, TrackResult};

use crate::mapping::selector::HookSelector;

/// Document metadata identifying the bound library.
#[derive(Debug, Clone)]
pub struct MappingMeta {
    pub author: String,
    pub library: String,
    pub library_version: String,
    pub mapping_version: String,
}

/// Granularity a default hook set applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Module,
    Class,
    Function,
}

/// A declared binding of an event to a member selector.
#[derive(Debug, Clone)]
pub struct Hook {
    pub event: String,
    pub selector: HookSelector,
}

impl Hook {
    pub fn new(event: impl Into<String>, selector: HookSelector) -> Self {
        Self {
            event: event.into(),
            selector,
        }
    }

    /// True when this hook covers the given member name.
    pub fn is_applicable(&self, member: &str) -> bool {
        self.selector.matches(member)
    }
}

/// Default hook sets applied when an algorithm declares none, keyed by the
/// granularity of the wrapped target.
#[derive(Debug, Clone, Default)]
pub struct DefaultHooks {
    pub modules: Vec<Hook>,
    pub classes: Vec<Hook>,
    pub fns: Vec<Hook>,
}

impl DefaultHooks {
    pub fn for_granularity(&self, granularity: Granularity) -> &[Hook] {
        match granularity {
            Granularity::Module => &self.modules,
            Granularity::Class => &self.classes,
            Granularity::Function => &self.fns,
        }
    }
}

/// A named operation with per-library implementation references.
#[derive(Debug, Clone)]
pub struct Algorithm {
    pub name: String,
    pub other_names: Vec<String>,
    /// Target library name to dotted implementation reference.
    pub implementation: BTreeMap<String, String>,
    pub hooks: Vec<Hook>,
}

/// Source provenance of a loaded document.
#[derive(Debug, Clone)]
pub struct MappingSource {
    pub path: PathBuf,
    pub sha256: String,
}

/// A loaded, immutable mapping document.
#[derive(Debug, Clone)]
pub struct MappingDocument {
    pub meta: MappingMeta,
    pub default_hooks: Arc<DefaultHooks>,
    pub algorithms: Vec<Algorithm>,
    pub source: MappingSource,
}

impl MappingDocument {
    /// Materialize the resolved target mappings this document declares.
    pub fn target_mappings(&self) -> TrackResult<Vec<Arc<TargetMapping>>> {
        let mut resolved = Vec::new();
        for algorithm in &self.algorithms {
            for (library, reference) in &algorithm.implementation {
                let reference = normalize_reference(reference)?;
                resolved.push(Arc::new(TargetMapping {
                    reference,
                    library: library.clone(),
                    library_version: self.meta.library_version.clone(),
                    algorithm: algorithm.name.clone(),
                    hooks: algorithm.hooks.clone(),
                    default_hooks: Arc::clone(&self.default_hooks),
                    source: Some(self.source.clone()),
                    inherited_from: None,
                }));
            }
        }
        Ok(resolved)
    }
}

/// A resolved algorithm mapping: the unit the interceptor and the wrapping
/// engine operate on.
#[derive(Debug, Clone)]
pub struct TargetMapping {
    /// Normalized dotted path `pkg.sub.Name[.member]`.
    pub reference: String,
    pub library: String,
    pub library_version: String,
    pub algorithm: String,
    /// Hooks declared on the algorithm; empty means "use defaults".
    pub hooks: Vec<Hook>,
    pub default_hooks: Arc<DefaultHooks>,
    pub source: Option<MappingSource>,
    /// Reference of the wrapped ancestor this mapping was propagated from.
    pub inherited_from: Option<String>,
}

impl TargetMapping {
    /// Hooks in effect for a target of the given granularity.
    pub fn effective_hooks(&self, granularity: Granularity) -> &[Hook] {
        if self.hooks.is_empty() {
            self.default_hooks.for_granularity(granularity)
        } else {
            &self.hooks
        }
    }

    /// Last segment of the reference (the member or type name).
    pub fn reference_name(&self) -> &str {
        self.reference.rsplit('.').next().unwrap_or(&self.reference)
    }

    /// Derive a mapping for `subclass_reference` inheriting this mapping's
    /// hooks, recording the ancestor it came from.
    pub fn inherit_for(&self, subclass_reference: &str) -> TrackResult<TargetMapping> {
        Ok(TargetMapping {
            reference: normalize_reference(subclass_reference)?,
            library: self.library.clone(),
            library_version: self.library_version.clone(),
            algorithm: self.algorithm.clone(),
            hooks: self.hooks.clone(),
            default_hooks: Arc::clone(&self.default_hooks),
            source: self.source.clone(),
            inherited_from: Some(self.reference.clone()),
        })
    }

    /// Derive a mapping for a member discovered under a wrapped module.
    pub fn for_member(&self, member: &str) -> TrackResult<TargetMapping> {
        let reference = normalize_reference(&format!("{}.{}", self.reference, member))?;
        Ok(TargetMapping {
            reference,
            library: self.library.clone(),
            library_version: self.library_version.clone(),
            algorithm: self.algorithm.clone(),
            hooks: Vec::new(),
            default_hooks: Arc::clone(&self.default_hooks),
            source: self.source.clone(),
            inherited_from: None,
        })
    }
}

/// Normalize and validate a dotted reference.
pub fn normalize_reference(reference: &str) -> TrackResult<String> {
    let trimmed = reference.trim();
    if trimmed.is_empty()
        || !trimmed
            .split('.')
            .all(|segment| !segment.is_empty() && segment.chars().all(is_identifier_char))
    {
        return Err(usage!(
            ErrorCode::InvalidMapping,
            "reference '{}' is not a dotted identifier path",
            reference
        ));
    }
    Ok(trimmed.to_string())
}

fn is_identifier_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_with_hooks(hooks: Vec<Hook>, defaults: DefaultHooks) -> TargetMapping {
        TargetMapping {
            reference: "lib.tree.Classifier".to_string(),
            library: "lib".to_string(),
            library_version: "1.0".to_string(),
            algorithm: "classifier".to_string(),
            hooks,
            default_hooks: Arc::new(defaults),
            source: None,
            inherited_from: None,
        }
    }

    #[test]
    fn normalize_rejects_malformed_paths() {
        assert!(normalize_reference("lib.mod.f").is_ok());
        assert!(normalize_reference("lib..f").is_err());
        assert!(normalize_reference("").is_err());
        assert!(normalize_reference("lib.mo-d.f").is_err());
    }

    #[test]
    fn empty_hooks_fall_back_to_defaults() {
        let defaults = DefaultHooks {
            classes: vec![Hook::new("pads_init", HookSelector::Always)],
            ..DefaultHooks::default()
        };
        let mapping = mapping_with_hooks(Vec::new(), defaults);
        let hooks = mapping.effective_hooks(Granularity::Class);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].event, "pads_init");
        assert!(mapping.effective_hooks(Granularity::Function).is_empty());
    }

    #[test]
    fn declared_hooks_shadow_defaults() {
        let defaults = DefaultHooks {
            classes: vec![Hook::new("pads_init", HookSelector::Always)],
            ..DefaultHooks::default()
        };
        let declared = vec![Hook::new(
            "pads_fit",
            HookSelector::Names(vec!["fit".to_string()]),
        )];
        let mapping = mapping_with_hooks(declared, defaults);
        let hooks = mapping.effective_hooks(Granularity::Class);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].event, "pads_fit");
    }

    #[test]
    fn inherit_records_ancestor() {
        let mapping = mapping_with_hooks(Vec::new(), DefaultHooks::default());
        let child = mapping.inherit_for("user.models.Child").expect("inherit");
        assert_eq!(child.inherited_from.as_deref(), Some("lib.tree.Classifier"));
        assert_eq!(child.reference, "user.models.Child");
        assert_eq!(child.library, "lib");
    }

    #[test]
    fn reference_name_is_last_segment() {
        let mapping = mapping_with_hooks(Vec::new(), DefaultHooks::default());
        assert_eq!(mapping.reference_name(), "Classifier");
    }
}
