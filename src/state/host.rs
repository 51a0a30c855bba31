//! The hosting element contract.
//!
//! A participant never reflects over its host. Instead the host exposes its
//! shareable properties by name through [`StateHost`], either by implementing
//! the trait on its own type or by registering accessor closures with
//! [`HostAccessors`]. [`MemoryHost`] is a map-backed host for tests and
//! simple embeddings.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context key under which the host's object type name is exposed.
pub const OBJECT_API_NAME: &str = "objectApiName";
/// Context key under which the host's record identifier is exposed.
pub const RECORD_ID: &str = "recordId";

// ---------------------------------------------------------------------------
// Context and events
// ---------------------------------------------------------------------------

/// Ambient values provided by the host environment.
///
/// They are always available to merge fields without any broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostContext {
    pub object_api_name: Option<String>,
    pub record_id: Option<String>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object_api_name(mut self, name: impl Into<String>) -> Self {
        self.object_api_name = Some(name.into());
        self
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    /// The non-empty context values as `(merge field, value)` pairs.
    pub fn entries(&self) -> Vec<(&'static str, Value)> {
        let mut entries = Vec::new();
        if let Some(name) = self.object_api_name.as_deref().filter(|s| !s.is_empty()) {
            entries.push((OBJECT_API_NAME, Value::String(name.to_string())));
        }
        if let Some(id) = self.record_id.as_deref().filter(|s| !s.is_empty()) {
            entries.push((RECORD_ID, Value::String(id.to_string())));
        }
        entries
    }
}

/// Severity of a user-visible toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Info,
    Success,
    Warning,
    Error,
}

/// One-way notifications a participant or consumer sends to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// State handling finished its first registration pass.
    Initialize,
    /// A message to show to the user.
    Toast {
        title: String,
        message: String,
        variant: ToastVariant,
    },
    /// A domain event such as `recordselectionchange`.
    Custom { name: String, detail: Value },
}

impl HostEvent {
    pub fn error_toast(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Toast {
            title: title.into(),
            message: message.into(),
            variant: ToastVariant::Error,
        }
    }

    pub fn custom(name: impl Into<String>, detail: Value) -> Self {
        Self::Custom {
            name: name.into(),
            detail,
        }
    }
}

// ---------------------------------------------------------------------------
// StateHost
// ---------------------------------------------------------------------------

/// The element a participant is attached to.
pub trait StateHost {
    /// Type name of the host; the participant's default display name.
    fn type_name(&self) -> &str;

    /// Current value of a named property, `None` if the host has no such
    /// property or it was never set.
    fn property(&self, name: &str) -> Option<Value>;

    /// Overwrite a named property.
    fn set_property(&self, name: &str, value: Value);

    /// Ambient context values.
    fn context(&self) -> HostContext {
        HostContext::default()
    }

    /// Receive a one-way notification.
    fn dispatch_event(&self, _event: HostEvent) {}
}

// ---------------------------------------------------------------------------
// HostAccessors
// ---------------------------------------------------------------------------

type Getter = Box<dyn Fn() -> Option<Value>>;
type Setter = Box<dyn Fn(Value)>;

struct PropertyAccessor {
    get: Getter,
    set: Setter,
}

/// A host assembled from per-property accessor closures.
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use serde_json::{json, Value};
/// use state_sync::state::{HostAccessors, StateHost};
///
/// let title = Rc::new(RefCell::new(json!("Orders for {region}")));
/// let (get, set) = (title.clone(), title.clone());
/// let host = HostAccessors::new("OrderPanel")
///     .with_property("title", move || Some(get.borrow().clone()), move |v: Value| *set.borrow_mut() = v);
///
/// host.set_property("title", json!("Orders for EU"));
/// assert_eq!(*title.borrow(), json!("Orders for EU"));
/// ```
pub struct HostAccessors {
    type_name: String,
    accessors: HashMap<String, PropertyAccessor>,
    context: HostContext,
    event_sink: Option<Box<dyn Fn(HostEvent)>>,
}

impl HostAccessors {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            accessors: HashMap::new(),
            context: HostContext::default(),
            event_sink: None,
        }
    }

    /// Register the getter and setter of a named property.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        get: impl Fn() -> Option<Value> + 'static,
        set: impl Fn(Value) + 'static,
    ) -> Self {
        self.accessors.insert(
            name.into(),
            PropertyAccessor {
                get: Box::new(get),
                set: Box::new(set),
            },
        );
        self
    }

    pub fn with_context(mut self, context: HostContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_event_sink(mut self, sink: impl Fn(HostEvent) + 'static) -> Self {
        self.event_sink = Some(Box::new(sink));
        self
    }

    /// Names of all registered properties.
    pub fn property_names(&self) -> Vec<&str> {
        self.accessors.keys().map(String::as_str).collect()
    }
}

impl StateHost for HostAccessors {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.accessors.get(name).and_then(|a| (a.get)())
    }

    fn set_property(&self, name: &str, value: Value) {
        match self.accessors.get(name) {
            Some(accessor) => (accessor.set)(value),
            None => log::warn!(
                target: "state_sync::property",
                "{}: no accessor registered for property '{}'",
                self.type_name,
                name
            ),
        }
    }

    fn context(&self) -> HostContext {
        self.context.clone()
    }

    fn dispatch_event(&self, event: HostEvent) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }
}

impl fmt::Debug for HostAccessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAccessors")
            .field("type_name", &self.type_name)
            .field("properties", &self.property_names())
            .field("context", &self.context)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryHost
// ---------------------------------------------------------------------------

/// A map-backed host that records every write and event it receives.
#[derive(Debug, Default)]
pub struct MemoryHost {
    type_name: String,
    context: HostContext,
    properties: RefCell<HashMap<String, Value>>,
    writes: RefCell<HashMap<String, usize>>,
    events: RefCell<Vec<HostEvent>>,
}

impl MemoryHost {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Seed a property without counting it as a write.
    pub fn with_property(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.borrow_mut().insert(name.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: HostContext) -> Self {
        self.context = context;
        self
    }

    /// Current value of a property (`None` when never set).
    pub fn get(&self, name: &str) -> Option<Value> {
        self.properties.borrow().get(name).cloned()
    }

    /// Number of writes a property has received through [`StateHost::set_property`].
    pub fn write_count(&self, name: &str) -> usize {
        self.writes.borrow().get(name).copied().unwrap_or(0)
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.borrow().clone()
    }
}

impl StateHost for MemoryHost {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.get(name)
    }

    fn set_property(&self, name: &str, value: Value) {
        *self.writes.borrow_mut().entry(name.to_string()).or_insert(0) += 1;
        self.properties.borrow_mut().insert(name.to_string(), value);
    }

    fn context(&self) -> HostContext {
        self.context.clone()
    }

    fn dispatch_event(&self, event: HostEvent) {
        self.events.borrow_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn test_context_entries_skip_empty_values() {
        let context = HostContext::new()
            .with_object_api_name("Account")
            .with_record_id("");
        assert_eq!(context.entries(), vec![(OBJECT_API_NAME, json!("Account"))]);
        assert!(HostContext::default().entries().is_empty());
    }

    #[test]
    fn test_memory_host_counts_writes() {
        let host = MemoryHost::new("Panel").with_property("title", "{x}");
        assert_eq!(host.get("title"), Some(json!("{x}")));
        assert_eq!(host.write_count("title"), 0);
        host.set_property("title", json!("done"));
        assert_eq!(host.write_count("title"), 1);
        assert_eq!(host.property("title"), Some(json!("done")));
        assert_eq!(host.property("missing"), None);
    }

    #[test]
    fn test_accessors_route_by_name() {
        let store = Rc::new(RefCell::new(json!("{a}")));
        let events = Rc::new(RefCell::new(Vec::new()));
        let (get, set, sink) = (store.clone(), store.clone(), events.clone());
        let host = HostAccessors::new("Widget")
            .with_property("label", move || Some(get.borrow().clone()), move |v| *set.borrow_mut() = v)
            .with_context(HostContext::new().with_record_id("001"))
            .with_event_sink(move |e| sink.borrow_mut().push(e));

        assert_eq!(host.type_name(), "Widget");
        assert_eq!(host.property("label"), Some(json!("{a}")));
        assert_eq!(host.property("other"), None);

        host.set_property("label", json!("resolved"));
        host.set_property("other", json!("ignored"));
        assert_eq!(*store.borrow(), json!("resolved"));

        host.dispatch_event(HostEvent::Initialize);
        assert_eq!(*events.borrow(), vec![HostEvent::Initialize]);
        assert_eq!(host.context().record_id.as_deref(), Some("001"));
    }
}
