//! Registry of declared and discovered target mappings.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

use trackpads_errors::TrackResult;

use crate::logging::record_discarded_mapping;
use crate::mapping::loader::MappingAggregator;
use crate::mapping::model::{MappingDocument, TargetMapping};

/// Holds the mappings loaded from documents plus subclass mappings
/// discovered while modules register. Inserts synchronize on a single
/// write lock; readers take cheap snapshots so discovery walks never block
/// dispatching.
pub struct MappingRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    documents: Vec<MappingDocument>,
    declared: Vec<Arc<TargetMapping>>,
    discovered: Vec<Arc<TargetMapping>>,
    references: HashSet<String>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                documents: Vec::new(),
                declared: Vec::new(),
                discovered: Vec::new(),
                references: HashSet::new(),
            }),
        }
    }

    /// Load mapping documents from the given paths and register their
    /// algorithm mappings. Malformed documents are skipped with a log
    /// entry; loading continues.
    pub fn load_paths(&self, paths: &[std::path::PathBuf]) -> TrackResult<()> {
        for path in paths {
            let mut aggregator = MappingAggregator::default();
            match aggregator.ingest_file(Path::new(path)) {
                Ok(()) => {
                    for document in aggregator.finish() {
                        self.add_document(document)?;
                    }
                }
                Err(err) => {
                    record_discarded_mapping("load_failure");
                    crate::logging::log_track_error("skipping mapping document", &err);
                }
            }
        }
        Ok(())
    }

    /// Register an already-parsed document.
    pub fn add_document(&self, document: MappingDocument) -> TrackResult<()> {
        let mappings = document.target_mappings()?;
        let mut inner = self.inner.write().expect("mapping registry lock");
        inner.documents.push(document);
        for mapping in mappings {
            if inner.references.insert(mapping.reference.clone()) {
                inner.declared.push(mapping);
            } else {
                record_discarded_mapping("duplicate_reference");
                log::debug!(
                    target: "trackpads::mapping",
                    "duplicate mapping for '{}' discarded",
                    mapping.reference
                );
            }
        }
        Ok(())
    }

    /// Register a single programmatic mapping (declared set).
    pub fn add_mapping(&self, mapping: TargetMapping) -> bool {
        let mut inner = self.inner.write().expect("mapping registry lock");
        if inner.references.insert(mapping.reference.clone()) {
            inner.declared.push(Arc::new(mapping));
            true
        } else {
            record_discarded_mapping("duplicate_reference");
            false
        }
    }

    /// Register a dynamically discovered subclass mapping. Duplicates keep
    /// the first registration and report `false`.
    pub fn add_found_class(&self, mapping: TargetMapping) -> bool {
        let mut inner = self.inner.write().expect("mapping registry lock");
        if inner.references.insert(mapping.reference.clone()) {
            log::debug!(
                target: "trackpads::mapping",
                "discovered subclass mapping '{}' (from '{}')",
                mapping.reference,
                mapping.inherited_from.as_deref().unwrap_or("<direct>")
            );
            inner.discovered.push(Arc::new(mapping));
            true
        } else {
            record_discarded_mapping("duplicate_reference");
            false
        }
    }

    /// Snapshot of the declared algorithm mappings.
    pub fn get_algorithms(&self) -> Vec<Arc<TargetMapping>> {
        self.inner
            .read()
            .expect("mapping registry lock")
            .declared
            .clone()
    }

    /// Snapshot of declared plus discovered mappings.
    pub fn get_relevant_mappings(&self) -> Vec<Arc<TargetMapping>> {
        let inner = self.inner.read().expect("mapping registry lock");
        let mut all = inner.declared.clone();
        all.extend(inner.discovered.iter().cloned());
        all
    }

    /// Look up the mapping registered for an exact reference.
    pub fn find_reference(&self, reference: &str) -> Option<Arc<TargetMapping>> {
        let inner = self.inner.read().expect("mapping registry lock");
        inner
            .declared
            .iter()
            .chain(inner.discovered.iter())
            .find(|m| m.reference == reference)
            .cloned()
    }

    /// Root module names (first reference segment) of all known mappings.
    pub fn root_modules(&self) -> HashSet<String> {
        self.get_relevant_mappings()
            .iter()
            .filter_map(|m| m.reference.split('.').next().map(str::to_string))
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.inner
            .read()
            .expect("mapping registry lock")
            .documents
            .len()
    }
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::model::DefaultHooks;

    fn mapping(reference: &str) -> TargetMapping {
        TargetMapping {
            reference: reference.to_string(),
            library: "lib".to_string(),
            library_version: "1.0".to_string(),
            algorithm: "algo".to_string(),
            hooks: Vec::new(),
            default_hooks: Arc::new(DefaultHooks::default()),
            source: None,
            inherited_from: None,
        }
    }

    #[test]
    fn duplicate_references_keep_first() {
        let registry = MappingRegistry::new();
        assert!(registry.add_mapping(mapping("lib.mod.f")));
        assert!(!registry.add_mapping(mapping("lib.mod.f")));
        assert_eq!(registry.get_algorithms().len(), 1);
    }

    #[test]
    fn discovered_mappings_show_up_in_relevant_set_only() {
        let registry = MappingRegistry::new();
        registry.add_mapping(mapping("lib.a.Base"));
        registry.add_found_class(mapping("user.models.Child"));

        assert_eq!(registry.get_algorithms().len(), 1);
        assert_eq!(registry.get_relevant_mappings().len(), 2);
        assert!(registry.find_reference("user.models.Child").is_some());
    }

    #[test]
    fn duplicate_discovery_is_rejected() {
        let registry = MappingRegistry::new();
        assert!(registry.add_found_class(mapping("user.models.Child")));
        assert!(!registry.add_found_class(mapping("user.models.Child")));
        assert_eq!(registry.get_relevant_mappings().len(), 1);
    }

    #[test]
    fn root_modules_are_first_segments() {
        let registry = MappingRegistry::new();
        registry.add_mapping(mapping("lib.mod.f"));
        registry.add_mapping(mapping("lib.other.g"));
        registry.add_mapping(mapping("another.thing.C"));
        let roots = registry.root_modules();
        assert!(roots.contains("lib"));
        assert!(roots.contains("another"));
        assert_eq!(roots.len(), 2);
    }
}
