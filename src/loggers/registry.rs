//! Name to logging-function lookup with library/version specificity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashSet;

use crate::logging::with_error_code;
use crate::loggers::LoggingFunction;
use trackpads_errors::ErrorCode;

type LoggerKey = (String, Option<String>, Option<String>);

/// Holds logging functions under `(name, library, version)` keys. Lookup
/// prefers the most specific key and falls back to `(name, library)` and
/// then the bare name. Re-registration under an identical key replaces.
pub struct FunctionRegistry {
    fns: RwLock<HashMap<LoggerKey, Arc<dyn LoggingFunction>>>,
    warned_events: DashSet<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            fns: RwLock::new(HashMap::new()),
            warned_events: DashSet::new(),
        }
    }

    /// Register a logger for every library.
    pub fn add_function(&self, name: &str, f: Arc<dyn LoggingFunction>) {
        self.insert((name.to_string(), None, None), f);
    }

    /// Register a logger specific to a library.
    pub fn add_for_library(&self, name: &str, lib: &str, f: Arc<dyn LoggingFunction>) {
        self.insert((name.to_string(), Some(lib.to_string()), None), f);
    }

    /// Register a logger specific to a library version.
    pub fn add_for_version(&self, name: &str, lib: &str, version: &str, f: Arc<dyn LoggingFunction>) {
        self.insert(
            (
                name.to_string(),
                Some(lib.to_string()),
                Some(version.to_string()),
            ),
            f,
        );
    }

    fn insert(&self, key: LoggerKey, f: Arc<dyn LoggingFunction>) {
        self.fns.write().expect("function registry lock").insert(key, f);
    }

    /// Find the most specific logger for `name`, `lib`, `version`. A miss
    /// warns once per event name and returns `None`.
    pub fn find_function(
        &self,
        name: &str,
        lib: Option<&str>,
        version: Option<&str>,
    ) -> Option<Arc<dyn LoggingFunction>> {
        let fns = self.fns.read().expect("function registry lock");
        let found = lib
            .and_then(|lib| {
                version
                    .and_then(|version| {
                        fns.get(&(
                            name.to_string(),
                            Some(lib.to_string()),
                            Some(version.to_string()),
                        ))
                    })
                    .or_else(|| fns.get(&(name.to_string(), Some(lib.to_string()), None)))
            })
            .or_else(|| fns.get(&(name.to_string(), None, None)))
            .cloned();

        if found.is_none() && self.warned_events.insert(name.to_string()) {
            with_error_code(ErrorCode::LoggerNotFound, || {
                log::warn!(
                    target: "trackpads::loggers",
                    "event '{}' is not linked with any logging functionality",
                    name
                );
            });
        }
        found
    }

    /// Every logger applicable to `name` regardless of specificity, most
    /// specific first.
    pub fn find_applicable(&self, name: &str) -> Vec<Arc<dyn LoggingFunction>> {
        let fns = self.fns.read().expect("function registry lock");
        let mut keyed: Vec<(&LoggerKey, &Arc<dyn LoggingFunction>)> =
            fns.iter().filter(|(key, _)| key.0 == name).collect();
        keyed.sort_by_key(|(key, _)| match (&key.1, &key.2) {
            (Some(_), Some(_)) => 0,
            (Some(_), None) => 1,
            _ => 2,
        });
        keyed.into_iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    pub fn len(&self) -> usize {
        self.fns.read().expect("function registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::{LoggerEnv, PhaseResult};

    struct Named(&'static str);

    impl LoggingFunction for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn pre(&self, _env: &LoggerEnv<'_>) -> PhaseResult {
            PhaseResult::Ok(None)
        }
    }

    #[test]
    fn specificity_prefers_version_then_library_then_name() {
        let registry = FunctionRegistry::new();
        registry.add_function("parameters", Arc::new(Named("generic")));
        registry.add_for_library("parameters", "sklearn", Arc::new(Named("lib")));
        registry.add_for_version("parameters", "sklearn", "0.21", Arc::new(Named("versioned")));

        let versioned = registry
            .find_function("parameters", Some("sklearn"), Some("0.21"))
            .expect("versioned hit");
        assert_eq!(versioned.name(), "versioned");

        let lib = registry
            .find_function("parameters", Some("sklearn"), Some("0.99"))
            .expect("library fallback");
        assert_eq!(lib.name(), "lib");

        let generic = registry
            .find_function("parameters", Some("torch"), None)
            .expect("name fallback");
        assert_eq!(generic.name(), "generic");
    }

    #[test]
    fn missing_logger_returns_none() {
        let registry = FunctionRegistry::new();
        assert!(registry.find_function("nope", None, None).is_none());
        // A second miss must stay silent; behaviourally it is still a miss.
        assert!(registry.find_function("nope", None, None).is_none());
    }

    #[test]
    fn re_registration_replaces() {
        let registry = FunctionRegistry::new();
        registry.add_function("parameters", Arc::new(Named("first")));
        registry.add_function("parameters", Arc::new(Named("second")));
        assert_eq!(registry.len(), 1);
        let found = registry
            .find_function("parameters", None, None)
            .expect("present");
        assert_eq!(found.name(), "second");
    }

    #[test]
    fn find_applicable_orders_by_specificity() {
        let registry = FunctionRegistry::new();
        registry.add_function("output", Arc::new(Named("generic")));
        registry.add_for_library("output", "sklearn", Arc::new(Named("lib")));
        let applicable = registry.find_applicable("output");
        assert_eq!(applicable.len(), 2);
        assert_eq!(applicable[0].name(), "lib");
        assert_eq!(applicable[1].name(), "generic");
    }
}
