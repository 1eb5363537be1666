//! Hook/event resolution: which loggers run around a given target.
//!
//! Mappings declare *hooks* (event, member selector). The run configuration
//! wires logging events onto hook events. Resolution intersects the two and
//! produces the ordered chain the dispatcher folds. The result depends on
//! the run-scoped configuration, so it is recomputed per call.

use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;

use crate::config::TrackingConfig;
use crate::loggers::{FunctionRegistry, LoggingFunction};
use crate::mapping::{Granularity, TargetMapping};

/// One entry of a resolved logger chain.
#[derive(Clone)]
pub struct ResolvedHook {
    /// Logging event name from the configuration.
    pub event: String,
    pub logger: Arc<dyn LoggingFunction>,
    /// The configuration's `with` parameter bag for this event.
    pub params: Map<String, Value>,
    pub order: i64,
}

impl std::fmt::Debug for ResolvedHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHook")
            .field("event", &self.event)
            .field("logger", &self.logger.name())
            .field("order", &self.order)
            .finish()
    }
}

/// Resolve the ordered list of loggers applicable to `member` of a target
/// wrapped under `mapping`. Events without a registered logger are skipped
/// (the registry warns once per event). The sort is stable: equal orders
/// keep configuration order.
pub fn resolve_hooks(
    config: &TrackingConfig,
    functions: &FunctionRegistry,
    mapping: &TargetMapping,
    granularity: Granularity,
    member: &str,
) -> Vec<ResolvedHook> {
    let hook_events: Vec<String> = mapping
        .effective_hooks(granularity)
        .iter()
        .filter(|hook| hook.is_applicable(member))
        .map(|hook| hook.event.clone())
        .collect();
    if hook_events.is_empty() {
        return Vec::new();
    }

    let mut resolved = Vec::new();
    for (event, wiring) in &config.events {
        if !wiring.on.matches(&hook_events) {
            continue;
        }
        let Some(logger) = functions.find_function(
            event,
            Some(mapping.library.as_str()),
            Some(mapping.library_version.as_str()),
        ) else {
            continue;
        };
        resolved.push(ResolvedHook {
            event: event.clone(),
            logger,
            params: wiring.with.clone(),
            order: wiring.order,
        });
    }
    resolved.sort_by_key(|hook| hook.order);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use crate::mapping::{DefaultHooks, Hook, HookSelector};
    use crate::loggers::{LoggerEnv, PhaseResult};
    use serde_json::json;

    struct Named(&'static str);

    impl LoggingFunction for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn pre(&self, _env: &LoggerEnv<'_>) -> PhaseResult {
            PhaseResult::Ok(None)
        }
    }

    fn mapping_with_fit_hook() -> TargetMapping {
        TargetMapping {
            reference: "lib.mod.Model".to_string(),
            library: "lib".to_string(),
            library_version: "1.0".to_string(),
            algorithm: "model".to_string(),
            hooks: vec![Hook::new(
                "pads_fit",
                HookSelector::Names(vec!["fit".to_string()]),
            )],
            default_hooks: Arc::new(DefaultHooks::default()),
            source: None,
            inherited_from: None,
        }
    }

    fn registry_with(names: &[&'static str]) -> FunctionRegistry {
        let registry = FunctionRegistry::new();
        for name in names {
            registry.add_function(name, Arc::new(Named(name)));
        }
        registry
    }

    #[test]
    fn intersection_selects_matching_events() {
        let mut config = TrackingConfig::default();
        config.events.clear();
        config
            .events
            .insert("parameters".to_string(), EventConfig::on(["pads_fit"]));
        config
            .events
            .insert("metric".to_string(), EventConfig::on(["pads_metric"]));

        let functions = registry_with(&["parameters", "metric"]);
        let mapping = mapping_with_fit_hook();

        let hooks = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "fit");
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].event, "parameters");

        let none = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "predict");
        assert!(none.is_empty());
    }

    #[test]
    fn missing_logger_is_skipped_not_fatal() {
        let mut config = TrackingConfig::default();
        config.events.clear();
        config
            .events
            .insert("unlinked".to_string(), EventConfig::on(["pads_fit"]));

        let functions = FunctionRegistry::new();
        let mapping = mapping_with_fit_hook();
        let hooks = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "fit");
        assert!(hooks.is_empty());
    }

    #[test]
    fn sort_is_stable_for_equal_orders() {
        let mut config = TrackingConfig::default();
        config.events.clear();
        config
            .events
            .insert("b_event".to_string(), EventConfig::on(["pads_fit"]));
        config
            .events
            .insert("a_event".to_string(), EventConfig::on(["pads_fit"]));
        config.events.insert(
            "early".to_string(),
            EventConfig::on(["pads_fit"]).with_order(0),
        );

        let functions = registry_with(&["a_event", "b_event", "early"]);
        let mapping = mapping_with_fit_hook();
        let hooks = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "fit");
        let events: Vec<&str> = hooks.iter().map(|h| h.event.as_str()).collect();
        assert_eq!(events, vec!["early", "b_event", "a_event"]);
    }

    #[test]
    fn with_params_are_carried() {
        let mut config = TrackingConfig::default();
        config.events.clear();
        config.events.insert(
            "output".to_string(),
            EventConfig::on(["pads_fit"]).with_param("write_format", json!("json")),
        );

        let functions = registry_with(&["output"]);
        let mapping = mapping_with_fit_hook();
        let hooks = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "fit");
        assert_eq!(hooks[0].params.get("write_format"), Some(&json!("json")));
    }

    #[test]
    fn always_wiring_matches_any_hook_event() {
        let mut config = TrackingConfig::default();
        config.events.clear();
        let mut wiring = EventConfig::on(["placeholder"]);
        wiring.on = crate::config::OnSelector::always();
        config.events.insert("audit".to_string(), wiring);

        let functions = registry_with(&["audit"]);
        let mapping = mapping_with_fit_hook();
        let hooks = resolve_hooks(&config, &functions, &mapping, Granularity::Class, "fit");
        assert_eq!(hooks.len(), 1);
    }
}
