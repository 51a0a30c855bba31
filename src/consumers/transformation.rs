//! Declarative state transformation.
//!
//! Maps incoming property values to outgoing ones using named rule sets
//! looked up from a [`TransformationRuleSource`]. A rule fires when its
//! source property and value match the update, or unconditionally when it is
//! dynamic; dynamic rules resolve their target value as a merge-field
//! template against everything the transformation has seen so far.

use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventLog, ServiceError, LOG_TARGET};
use crate::events::{PropertyChange, StateBus};
use crate::state::{HostEvent, ParticipantError, StartOptions, StateHost, StateParticipant};

/// One source-to-target mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub source_property: String,
    #[serde(default)]
    pub source_value: Value,
    pub target_property: String,
    /// Static value, or a merge-field template when `is_dynamic`.
    #[serde(default)]
    pub target_value: Value,
    #[serde(default)]
    pub is_dynamic: bool,
}

impl TransformationRule {
    pub fn fixed(
        source_property: impl Into<String>,
        source_value: impl Into<Value>,
        target_property: impl Into<String>,
        target_value: impl Into<Value>,
    ) -> Self {
        Self {
            source_property: source_property.into(),
            source_value: source_value.into(),
            target_property: target_property.into(),
            target_value: target_value.into(),
            is_dynamic: false,
        }
    }

    pub fn dynamic(target_property: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            source_property: String::new(),
            source_value: Value::Null,
            target_property: target_property.into(),
            target_value: Value::String(template.into()),
            is_dynamic: true,
        }
    }

    fn matches(&self, change: &PropertyChange) -> bool {
        self.is_dynamic || (self.source_property == change.name && self.source_value == change.value)
    }
}

/// Looks up rule sets by name.
#[async_trait(?Send)]
pub trait TransformationRuleSource {
    async fn get_transformation_rules(&self, name: &str) -> Result<Vec<TransformationRule>, ServiceError>;
}

/// A rule source backed by a map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuleSource {
    rule_sets: HashMap<String, Vec<TransformationRule>>,
}

impl InMemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule_set(mut self, name: impl Into<String>, rules: Vec<TransformationRule>) -> Self {
        self.rule_sets.insert(name.into(), rules);
        self
    }
}

#[async_trait(?Send)]
impl TransformationRuleSource for InMemoryRuleSource {
    async fn get_transformation_rules(&self, name: &str) -> Result<Vec<TransformationRule>, ServiceError> {
        self.rule_sets
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound {
                kind: "transformation".to_string(),
                name: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

struct TransformationHost {
    events: EventLog,
}

impl StateHost for TransformationHost {
    fn type_name(&self) -> &str {
        "DeclarativeStateTransformation"
    }

    fn property(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set_property(&self, _name: &str, _value: Value) {}

    fn dispatch_event(&self, event: HostEvent) {
        self.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// DeclarativeStateTransformation
// ---------------------------------------------------------------------------

/// A participant that republishes transformed values.
pub struct DeclarativeStateTransformation {
    transformation_name: String,
    host: Rc<TransformationHost>,
    participant: StateParticipant,
}

impl DeclarativeStateTransformation {
    pub fn new(bus: &StateBus, transformation_name: impl Into<String>) -> Self {
        let host = Rc::new(TransformationHost {
            events: EventLog::default(),
        });
        let participant = StateParticipant::new(bus, host.clone());
        Self {
            transformation_name: transformation_name.into(),
            host,
            participant,
        }
    }

    pub fn transformation_name(&self) -> &str {
        &self.transformation_name
    }

    pub fn participant(&self) -> &StateParticipant {
        &self.participant
    }

    /// Events sent to the host (initialization, error toasts).
    pub fn events(&self) -> Vec<HostEvent> {
        self.host.events.snapshot()
    }

    /// Fetch the rule set and start listening.
    ///
    /// On lookup failure the error is logged, an error toast is raised and
    /// the participant stays stopped.
    pub async fn connect(&self, source: &dyn TransformationRuleSource) -> Result<(), ServiceError> {
        let rules = match source.get_transformation_rules(&self.transformation_name).await {
            Ok(rules) => rules,
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "State Transformation query error: {} ({}): {}",
                    self.participant.identity(),
                    self.transformation_name,
                    err
                );
                self.host.dispatch_event(HostEvent::error_toast("Error", err.to_string()));
                return Err(err);
            }
        };
        log::debug!(
            target: LOG_TARGET,
            "{}: loaded {} rule(s)",
            self.transformation_name,
            rules.len()
        );

        let name = self.transformation_name.clone();
        let rules = Rc::new(rules);
        let started = self.participant.start(
            StartOptions::new()
                .context_name(format!("DeclarativeStateTransformation({})", name))
                .on_state_update(move |participant, change| {
                    apply_rules(&name, &rules, participant, change);
                }),
        );
        if let Err(ParticipantError::AlreadyListening(who)) = started {
            log::warn!(target: LOG_TARGET, "{} is already connected", who);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.participant.stop();
    }
}

fn apply_rules(
    transformation_name: &str,
    rules: &[TransformationRule],
    participant: &StateParticipant,
    change: &PropertyChange,
) {
    log::debug!(
        target: LOG_TARGET,
        "state-transform {}: {}: {}",
        transformation_name,
        change.name,
        change.value
    );
    participant.record_external(change.name.clone(), change.value.clone());

    for rule in rules.iter().filter(|r| r.matches(change)) {
        let target_value = if rule.is_dynamic {
            // A dynamic target without merge fields has no value.
            let resolved = rule
                .target_value
                .as_str()
                .and_then(|template| participant.resolve_template(template, true));
            match resolved {
                Some(value) => value,
                None => {
                    log::debug!(
                        target: LOG_TARGET,
                        "state-transform {}: {} has no merge fields, skipped",
                        transformation_name,
                        rule.target_property
                    );
                    continue;
                }
            }
        } else {
            rule.target_value.clone()
        };

        if participant.published_value(&rule.target_property).as_ref() != Some(&target_value) {
            log::debug!(
                target: LOG_TARGET,
                "dynamic-property-updated {}: {}",
                rule.target_property,
                target_value
            );
            participant.publish(rule.target_property.clone(), target_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DynamicPropertySpec, MemoryHost, ToastVariant};
    use serde_json::json;

    fn source() -> InMemoryRuleSource {
        InMemoryRuleSource::new().with_rule_set(
            "countryToCurrency",
            vec![
                TransformationRule::fixed("country", "DE", "currency", "EUR"),
                TransformationRule::fixed("country", "US", "currency", "USD"),
                TransformationRule::dynamic("criteria", "Country = '{country}' AND Segment = '{segment}'"),
            ],
        )
    }

    fn viewer(bus: &StateBus, template: &str) -> (StateParticipant, Rc<MemoryHost>) {
        let host = Rc::new(MemoryHost::new("Viewer").with_property("label", template));
        let p = StateParticipant::new(bus, host.clone());
        p.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("label")))
            .unwrap();
        (p, host)
    }

    #[test]
    fn test_rule_matching() {
        let rule = TransformationRule::fixed("country", "DE", "currency", "EUR");
        assert!(rule.matches(&PropertyChange::new("country", json!("DE"))));
        assert!(!rule.matches(&PropertyChange::new("country", json!("US"))));
        assert!(!rule.matches(&PropertyChange::new("region", json!("DE"))));
        assert!(TransformationRule::dynamic("t", "{x}").matches(&PropertyChange::new("any", json!(1))));
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: TransformationRule = serde_json::from_value(json!({
            "source_property": "country",
            "target_property": "currency"
        }))
        .unwrap();
        assert_eq!(rule.source_value, Value::Null);
        assert!(!rule.is_dynamic);
    }

    #[test]
    fn test_fixed_rule_publishes_target() {
        let bus = StateBus::new();
        let transformation = DeclarativeStateTransformation::new(&bus, "countryToCurrency");
        tokio_test::block_on(transformation.connect(&source())).unwrap();
        assert!(transformation.participant().is_monitoring_all());
        assert_eq!(transformation.events(), vec![HostEvent::Initialize]);

        let (_viewer, host) = viewer(&bus, "Currency: {currency}");
        let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("Picker")));
        picker.start(StartOptions::new()).unwrap();

        picker.publish("country", "DE");
        assert_eq!(host.get("label"), Some(json!("Currency: EUR")));
        picker.publish("country", "US");
        assert_eq!(host.get("label"), Some(json!("Currency: USD")));
    }

    #[test]
    fn test_dynamic_rule_waits_for_all_fields() {
        let bus = StateBus::new();
        let transformation = DeclarativeStateTransformation::new(&bus, "countryToCurrency");
        tokio_test::block_on(transformation.connect(&source())).unwrap();
        let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("Picker")));
        picker.start(StartOptions::new()).unwrap();

        picker.publish("country", "FR");
        assert_eq!(transformation.participant().published_value("criteria"), Some(json!("")));

        picker.publish("segment", "SMB");
        assert_eq!(
            transformation.participant().published_value("criteria"),
            Some(json!("Country = 'FR' AND Segment = 'SMB'"))
        );
    }

    #[test]
    fn test_dynamic_rule_without_merge_fields_is_skipped() {
        let bus = StateBus::new();
        let rules = InMemoryRuleSource::new().with_rule_set(
            "static",
            vec![
                TransformationRule::dynamic("criteria", "Country = 'DE'"),
                TransformationRule {
                    target_value: json!(42),
                    ..TransformationRule::dynamic("limit", "")
                },
            ],
        );
        let transformation = DeclarativeStateTransformation::new(&bus, "static");
        tokio_test::block_on(transformation.connect(&rules)).unwrap();
        let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("Picker")));
        picker.start(StartOptions::new()).unwrap();

        picker.publish("country", "DE");
        assert_eq!(transformation.participant().published_value("criteria"), None);
        assert_eq!(transformation.participant().published_value("limit"), None);
    }

    #[test]
    fn test_unchanged_target_is_not_republished() {
        let bus = StateBus::new();
        let transformation = DeclarativeStateTransformation::new(&bus, "countryToCurrency");
        tokio_test::block_on(transformation.connect(&source())).unwrap();
        let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("Picker")));
        picker.start(StartOptions::new()).unwrap();

        let currency_updates = Rc::new(std::cell::Cell::new(0));
        let c = currency_updates.clone();
        bus.on::<crate::events::StateUpdateMessage>("spy", move |m| {
            if m.property.name == "currency" {
                c.set(c.get() + 1);
            }
        });

        picker.publish("country", "DE");
        picker.publish("country", "DE");
        assert_eq!(currency_updates.get(), 1);
    }

    #[test]
    fn test_lookup_failure_raises_toast() {
        let bus = StateBus::new();
        let transformation = DeclarativeStateTransformation::new(&bus, "missing");
        let err = tokio_test::block_on(transformation.connect(&source())).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(!transformation.participant().is_initialized());
        match &transformation.events()[..] {
            [HostEvent::Toast { variant, message, .. }] => {
                assert_eq!(*variant, ToastVariant::Error);
                assert_eq!(message, "transformation not found: missing");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_stops_transforming() {
        let bus = StateBus::new();
        let transformation = DeclarativeStateTransformation::new(&bus, "countryToCurrency");
        tokio_test::block_on(transformation.connect(&source())).unwrap();
        transformation.disconnect();

        let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("Picker")));
        picker.start(StartOptions::new()).unwrap();
        picker.publish("country", "DE");
        assert_eq!(transformation.participant().published_value("currency"), None);
    }
}
