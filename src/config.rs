//! Run-scoped tracking configuration.
//!
//! The configuration connects mapping hook events to logging functions. It
//! is captured once per run as a backend tag under [`CONFIG_TAG`] and
//! reloaded when the process re-enters a run, so child workers observe the
//! exact event wiring of the parent.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trackpads_errors::{usage, ErrorCode, TrackResult};

/// Tag key the configuration is stored under on the active run.
pub const CONFIG_TAG: &str = "pads.config";

/// Order assigned to events that do not declare one.
pub const DEFAULT_ORDER: i64 = 1;

fn default_order() -> i64 {
    DEFAULT_ORDER
}

fn default_recursion_depth() -> i64 {
    -1
}

fn default_log_on_failure() -> bool {
    true
}

/// Hook events an event configuration listens on: the literal `"always"`
/// or an explicit set of hook event names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnSelector {
    Always(AlwaysToken),
    Events(Vec<String>),
}

/// Serde helper restricting the string form to the literal `always`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlwaysToken;

impl Serialize for AlwaysToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("always")
    }
}

impl<'de> Deserialize<'de> for AlwaysToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        if token == "always" {
            Ok(AlwaysToken)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected the literal 'always', got '{token}'"
            )))
        }
    }
}

impl OnSelector {
    pub fn always() -> Self {
        OnSelector::Always(AlwaysToken)
    }

    pub fn events<I: IntoIterator<Item = S>, S: Into<String>>(events: I) -> Self {
        OnSelector::Events(events.into_iter().map(Into::into).collect())
    }

    /// True when any of `hook_events` is selected.
    pub fn matches(&self, hook_events: &[String]) -> bool {
        match self {
            OnSelector::Always(_) => true,
            OnSelector::Events(events) => events.iter().any(|e| hook_events.contains(e)),
        }
    }
}

/// Configuration of a single logging event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Hook events this logging event listens on. Mandatory.
    pub on: OnSelector,
    /// Fixed parameter bag passed to the logger on every invocation.
    #[serde(default)]
    pub with: Map<String, Value>,
    /// Chain position; lower runs first. Defaults to [`DEFAULT_ORDER`].
    #[serde(default = "default_order")]
    pub order: i64,
}

impl EventConfig {
    pub fn on<I: IntoIterator<Item = S>, S: Into<String>>(events: I) -> Self {
        Self {
            on: OnSelector::events(events),
            with: Map::new(),
            order: DEFAULT_ORDER,
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.with.insert(key.to_string(), value);
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }
}

/// Process-wide tracking configuration attached to the active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Logging event name to its wiring. Insertion order is the stable
    /// tie-break for equal `order` values.
    pub events: IndexMap<String, EventConfig>,
    /// Skip hooks when the same receiver is already deeper in the stack.
    #[serde(default)]
    pub recursion_identity: bool,
    /// Maximum hook-bearing nesting depth; `-1` disables the cut-off.
    #[serde(default = "default_recursion_depth")]
    pub recursion_depth: i64,
    /// Invoke the pristine target when the hook chain fails.
    #[serde(default)]
    pub retry_on_fail: bool,
    /// Flush captured stdout as an artifact before propagating a failure.
    #[serde(default = "default_log_on_failure")]
    pub log_on_failure: bool,
    /// Record the git HEAD of the working directory on activation.
    #[serde(default)]
    pub mirror_git: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        let mut events = IndexMap::new();
        events.insert("init".to_string(), EventConfig::on(["pads_init"]));
        events.insert("parameters".to_string(), EventConfig::on(["pads_fit"]));
        events.insert(
            "input".to_string(),
            EventConfig::on(["pads_fit"]).with_param("write_format", Value::String("text".into())),
        );
        events.insert(
            "output".to_string(),
            EventConfig::on(["pads_fit", "pads_predict"])
                .with_param("write_format", Value::String("text".into())),
        );
        events.insert("metric".to_string(), EventConfig::on(["pads_metric"]));
        events.insert("log".to_string(), EventConfig::on(["pads_log"]));
        Self {
            events,
            recursion_identity: false,
            recursion_depth: -1,
            retry_on_fail: false,
            log_on_failure: true,
            mirror_git: false,
        }
    }
}

impl TrackingConfig {
    /// Parse a configuration from its tag representation.
    pub fn from_tag(raw: &str) -> TrackResult<Self> {
        let config: TrackingConfig = serde_json::from_str(raw).map_err(|err| {
            usage!(
                ErrorCode::InvalidConfig,
                "failed to parse tracking configuration: {}",
                err
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize for storage as a run tag.
    pub fn to_tag(&self) -> TrackResult<String> {
        serde_json::to_string(self).map_err(|err| {
            usage!(
                ErrorCode::SerializationFailed,
                "failed to serialize tracking configuration: {}",
                err
            )
        })
    }

    /// Reject wirings the resolver cannot honor.
    pub fn validate(&self) -> TrackResult<()> {
        for (event, wiring) in &self.events {
            if let OnSelector::Events(on) = &wiring.on {
                if on.is_empty() {
                    return Err(usage!(
                        ErrorCode::InvalidConfig,
                        "event '{}' declares an empty 'on' set",
                        event
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_tag() {
        let config = TrackingConfig::default();
        let tag = config.to_tag().expect("serialize config");
        let restored = TrackingConfig::from_tag(&tag).expect("parse config");
        assert_eq!(config, restored);
    }

    #[test]
    fn missing_on_is_a_parse_error() {
        let raw = r#"{"events": {"parameters": {"order": 2}}}"#;
        let err = TrackingConfig::from_tag(raw).expect_err("should reject missing on");
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn empty_on_set_is_rejected() {
        let raw = r#"{"events": {"parameters": {"on": []}}}"#;
        let err = TrackingConfig::from_tag(raw).expect_err("should reject empty on");
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn always_token_is_accepted() {
        let raw = r#"{"events": {"audit": {"on": "always"}}}"#;
        let config = TrackingConfig::from_tag(raw).expect("parse config");
        let audit = config.events.get("audit").expect("audit event");
        assert!(audit.on.matches(&["anything".to_string()]));
    }

    #[test]
    fn absent_order_defaults_to_one() {
        let raw = r#"{"events": {"parameters": {"on": ["pads_fit"]}}}"#;
        let config = TrackingConfig::from_tag(raw).expect("parse config");
        assert_eq!(config.events["parameters"].order, DEFAULT_ORDER);
        assert!(config.events["parameters"].with.is_empty());
    }

    #[test]
    fn default_wiring_matches_bundled_loggers() {
        let config = TrackingConfig::default();
        assert!(config.events.contains_key("parameters"));
        assert!(config.events["output"]
            .on
            .matches(&["pads_predict".to_string()]));
        assert_eq!(config.recursion_depth, -1);
        assert!(config.log_on_failure);
        assert!(!config.retry_on_fail);
    }
}
