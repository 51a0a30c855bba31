//! Dynamic properties: host properties whose value is a merge-field template
//! kept in sync with shared state.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::host::StateHost;
use crate::utilities::merge_fields::{extract_merge_fields, render_value, substitute};

const LOG_TARGET: &str = "state_sync::property";

/// Merge-field name to value.
pub type StateMap = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Spec and descriptor
// ---------------------------------------------------------------------------

/// A request to treat a host property as dynamic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPropertySpec {
    /// Host property name.
    pub name: String,
    /// Show `""` instead of `null` while a merge field is unresolved.
    #[serde(default)]
    pub empty_if_not_resolvable: bool,
}

impl DynamicPropertySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            empty_if_not_resolvable: false,
        }
    }

    pub fn empty_if_not_resolvable(mut self) -> Self {
        self.empty_if_not_resolvable = true;
        self
    }
}

/// A registered dynamic property together with its template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPropertyDescriptor {
    /// Host property name.
    pub name: String,
    /// The raw template captured at registration time.
    pub original_value: Option<String>,
    pub empty_if_not_resolvable: bool,
}

impl DynamicPropertyDescriptor {
    pub fn new(name: impl Into<String>, original_value: Option<String>) -> Self {
        Self {
            name: name.into(),
            original_value,
            empty_if_not_resolvable: false,
        }
    }

    pub fn from_spec(spec: &DynamicPropertySpec, original_value: impl Into<String>) -> Self {
        Self {
            name: spec.name.clone(),
            original_value: Some(original_value.into()),
            empty_if_not_resolvable: spec.empty_if_not_resolvable,
        }
    }

    pub fn with_empty_if_not_resolvable(mut self, empty: bool) -> Self {
        self.empty_if_not_resolvable = empty;
        self
    }

    /// Merge fields of the template, in order of occurrence.
    pub fn merge_fields(&self) -> Vec<String> {
        extract_merge_fields(self.original_value.as_deref())
    }

    /// The value shown while a merge field is unresolved.
    pub fn unresolved_value(&self) -> Value {
        if self.empty_if_not_resolvable {
            Value::String(String::new())
        } else {
            Value::Null
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution results
// ---------------------------------------------------------------------------

/// The outcome of resolving a template against a state map.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every merge field had a value.
    Merged(String),
    /// At least one merge field was missing; carries the policy value
    /// (`""` or `null`).
    Unresolved(Value),
}

impl Resolution {
    pub fn into_value(self) -> Value {
        match self {
            Self::Merged(s) => Value::String(s),
            Self::Unresolved(v) => v,
        }
    }

    fn reason(&self) -> UpdateReason {
        match self {
            Self::Merged(_) => UpdateReason::CurrentStateValues,
            Self::Unresolved(v) => UpdateReason::MissingMergeFieldValue {
                empty: v.is_string(),
            },
        }
    }
}

/// Why a dynamic property received its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    CurrentStateValues,
    MissingMergeFieldValue { empty: bool },
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrentStateValues => f.write_str("current state value(s)"),
            Self::MissingMergeFieldValue { empty: true } => {
                f.write_str("deletion (\"\") due to missing merge field value")
            }
            Self::MissingMergeFieldValue { empty: false } => {
                f.write_str("deletion (null) due to missing merge field value")
            }
        }
    }
}

/// What an update did to the host property.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The property was overwritten.
    Written { value: Value, reason: UpdateReason },
    /// The property already held the computed value.
    Skipped { value: Value, reason: UpdateReason },
    /// The descriptor has no template or no merge fields.
    Untouched,
}

impl UpdateOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

// ---------------------------------------------------------------------------
// DynamicPropertyUpdater
// ---------------------------------------------------------------------------

/// Keeps one host property in sync with a state map.
pub struct DynamicPropertyUpdater<'a> {
    host: &'a dyn StateHost,
    descriptor: &'a DynamicPropertyDescriptor,
    log_skipped: bool,
}

impl<'a> DynamicPropertyUpdater<'a> {
    pub fn new(host: &'a dyn StateHost, descriptor: &'a DynamicPropertyDescriptor) -> Self {
        Self {
            host,
            descriptor,
            log_skipped: true,
        }
    }

    pub fn with_skip_logging(mut self, enabled: bool) -> Self {
        self.log_skipped = enabled;
        self
    }

    /// Seed the property with its unresolved placeholder.
    pub fn initialize_value(&self) -> UpdateOutcome {
        if self.descriptor.merge_fields().is_empty() {
            return UpdateOutcome::Untouched;
        }
        let value = self.descriptor.unresolved_value();
        let reason = Resolution::Unresolved(value.clone()).reason();
        self.write(value, reason)
    }

    /// Resolve the template against `state` without touching the host.
    ///
    /// Returns `None` when there is no template or it holds no merge field.
    pub fn resolve_from_state(&self, state: &StateMap) -> Option<Resolution> {
        resolve_template(self.descriptor, state)
    }

    /// Resolve the template and write the result to the host, unless the
    /// host already holds exactly that value.
    pub fn update_target_from_state(&self, state: &StateMap) -> UpdateOutcome {
        match self.resolve_from_state(state) {
            Some(resolution) => {
                let reason = resolution.reason();
                self.write(resolution.into_value(), reason)
            }
            None => UpdateOutcome::Untouched,
        }
    }

    fn write(&self, value: Value, reason: UpdateReason) -> UpdateOutcome {
        let name = &self.descriptor.name;
        if self.host.property(name).as_ref() == Some(&value) {
            if self.log_skipped {
                log::debug!(
                    target: LOG_TARGET,
                    "{}: \"{}\" ({}) - (no difference - update skipped)",
                    name,
                    display_value(&value),
                    reason
                );
            }
            return UpdateOutcome::Skipped { value, reason };
        }
        log::debug!(target: LOG_TARGET, "{}: \"{}\" ({})", name, display_value(&value), reason);
        self.host.set_property(name, value.clone());
        UpdateOutcome::Written { value, reason }
    }
}

/// Resolve `descriptor`'s template against `state`.
///
/// A field is available when `state` holds a non-null value for it. With the
/// `null` policy a missing field's placeholder is blanked in the working copy;
/// with the `""` policy it is left as written. Either way the working copy is
/// discarded once any field is missing.
pub fn resolve_template(descriptor: &DynamicPropertyDescriptor, state: &StateMap) -> Option<Resolution> {
    let template = descriptor.original_value.as_deref().filter(|t| !t.is_empty())?;
    if descriptor.merge_fields().is_empty() {
        return None;
    }

    let mut missing = false;
    let merged = substitute(template, |field| match state.get(field) {
        Some(value) if !value.is_null() => Some(render_value(value)),
        _ => {
            missing = true;
            (!descriptor.empty_if_not_resolvable).then(String::new)
        }
    });

    if missing {
        Some(Resolution::Unresolved(descriptor.unresolved_value()))
    } else {
        Some(Resolution::Merged(merged))
    }
}

pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::host::MemoryHost;
    use serde_json::json;

    fn descriptor(template: &str) -> DynamicPropertyDescriptor {
        DynamicPropertyDescriptor::new("contactCriteria", Some(template.to_string()))
    }

    fn state(pairs: &[(&str, Value)]) -> StateMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_initialize_with_null_by_default() {
        let host = MemoryHost::new("Table");
        let d = descriptor("AccountId in ({selectedAccountIds})");
        let outcome = DynamicPropertyUpdater::new(&host, &d).initialize_value();
        assert!(outcome.is_written());
        assert_eq!(host.get("contactCriteria"), Some(Value::Null));
    }

    #[test]
    fn test_initialize_with_empty_string() {
        let host = MemoryHost::new("Table");
        let d = descriptor("AccountId in ({selectedAccountIds})").with_empty_if_not_resolvable(true);
        DynamicPropertyUpdater::new(&host, &d).initialize_value();
        assert_eq!(host.get("contactCriteria"), Some(json!("")));
    }

    #[test]
    fn test_initialize_without_merge_fields_is_noop() {
        let host = MemoryHost::new("Table");
        let d = descriptor("AccountId in ()");
        assert_eq!(DynamicPropertyUpdater::new(&host, &d).initialize_value(), UpdateOutcome::Untouched);
        assert_eq!(host.write_count("contactCriteria"), 0);
    }

    #[test]
    fn test_resolve_without_template() {
        let host = MemoryHost::new("Table");
        let d = DynamicPropertyDescriptor::new("contactCriteria", None);
        let updater = DynamicPropertyUpdater::new(&host, &d);
        assert_eq!(updater.resolve_from_state(&StateMap::new()), None);
        assert_eq!(updater.update_target_from_state(&StateMap::new()), UpdateOutcome::Untouched);
        assert_eq!(resolve_template(&descriptor(""), &StateMap::new()), None);
    }

    #[test]
    fn test_resolve_missing_state_value() {
        let d = descriptor("AccountId in ({selectedAccountIds})");
        assert_eq!(
            resolve_template(&d, &StateMap::new()),
            Some(Resolution::Unresolved(Value::Null))
        );
        let d = d.with_empty_if_not_resolvable(true);
        assert_eq!(
            resolve_template(&d, &StateMap::new()),
            Some(Resolution::Unresolved(json!("")))
        );
    }

    #[test]
    fn test_null_state_value_counts_as_missing() {
        let d = descriptor("{a}");
        let s = state(&[("a", Value::Null)]);
        assert_eq!(resolve_template(&d, &s), Some(Resolution::Unresolved(Value::Null)));
    }

    #[test]
    fn test_resolve_all_fields() {
        let d = descriptor("AccountId in ({ids}) AND Country='{country}' AND Limit={limit}");
        let s = state(&[("ids", json!("'001','002'")), ("country", json!("DE")), ("limit", json!(5))]);
        assert_eq!(
            resolve_template(&d, &s),
            Some(Resolution::Merged(
                "AccountId in ('001','002') AND Country='DE' AND Limit=5".to_string()
            ))
        );
    }

    #[test]
    fn test_resolve_one_of_two_missing() {
        let d = descriptor("{a} {b}");
        let s = state(&[("a", json!("x"))]);
        assert_eq!(resolve_template(&d, &s), Some(Resolution::Unresolved(Value::Null)));
    }

    #[test]
    fn test_resolve_repeated_field() {
        let d = descriptor("{a}/{a}");
        let s = state(&[("a", json!("x"))]);
        assert_eq!(resolve_template(&d, &s), Some(Resolution::Merged("x/x".to_string())));
    }

    #[test]
    fn test_substituted_value_is_not_rescanned() {
        let d = descriptor("{a}-{b}");
        let s = state(&[("a", json!("{b}")), ("b", json!("y"))]);
        assert_eq!(resolve_template(&d, &s), Some(Resolution::Merged("{b}-y".to_string())));
    }

    #[test]
    fn test_update_is_idempotent() {
        let host = MemoryHost::new("Table");
        let d = descriptor("static {userName}");
        let s = state(&[("userName", json!("Ann"))]);
        let updater = DynamicPropertyUpdater::new(&host, &d);

        let first = updater.update_target_from_state(&s);
        let second = updater.update_target_from_state(&s);

        assert_eq!(
            first,
            UpdateOutcome::Written {
                value: json!("static Ann"),
                reason: UpdateReason::CurrentStateValues
            }
        );
        assert!(second.is_skipped());
        assert_eq!(host.write_count("contactCriteria"), 1);
        assert_eq!(host.get("contactCriteria"), Some(json!("static Ann")));
    }

    #[test]
    fn test_update_clears_when_value_disappears() {
        let host = MemoryHost::new("Table");
        let d = descriptor("{a}");
        let updater = DynamicPropertyUpdater::new(&host, &d).with_skip_logging(false);
        updater.update_target_from_state(&state(&[("a", json!("x"))]));
        let outcome = updater.update_target_from_state(&StateMap::new());
        assert_eq!(
            outcome,
            UpdateOutcome::Written {
                value: Value::Null,
                reason: UpdateReason::MissingMergeFieldValue { empty: false }
            }
        );
    }

    #[test]
    fn test_reason_tags() {
        assert_eq!(UpdateReason::CurrentStateValues.to_string(), "current state value(s)");
        assert_eq!(
            UpdateReason::MissingMergeFieldValue { empty: true }.to_string(),
            "deletion (\"\") due to missing merge field value"
        );
        assert_eq!(
            UpdateReason::MissingMergeFieldValue { empty: false }.to_string(),
            "deletion (null) due to missing merge field value"
        );
    }

    #[test]
    fn test_resolution_into_value() {
        assert_eq!(Resolution::Merged("a-b".to_string()).into_value(), json!("a-b"));
        assert_eq!(Resolution::Unresolved(json!("")).into_value(), json!(""));
        assert_eq!(Resolution::Unresolved(Value::Null).into_value(), Value::Null);
    }

    #[test]
    fn test_spec_deserializes_with_default_policy() {
        let spec: DynamicPropertySpec = serde_json::from_value(json!({"name": "criteria"})).unwrap();
        assert_eq!(spec, DynamicPropertySpec::new("criteria"));
        assert!(DynamicPropertySpec::new("x").empty_if_not_resolvable().empty_if_not_resolvable);
    }
}
