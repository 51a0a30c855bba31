//! The distributed state participant.
//!
//! A [`StateParticipant`] is owned by a hosting element and shares named
//! values with every other participant on the same [`StateBus`]:
//!
//! 1. [`start`](StateParticipant::start) registers the host's dynamic
//!    properties, seeds them, subscribes to both channels and broadcasts a
//!    [`StateInitRequestMessage`].
//! 2. Every other live participant answers the request by re-publishing
//!    each value it has itself published.
//! 3. From then on [`publish`](StateParticipant::publish) broadcasts to all,
//!    and incoming updates re-resolve the dynamic properties whose templates
//!    mention the published name.
//!
//! A participant never reacts to its own broadcasts. No `RefCell` borrow is
//! held while the bus or the host is called, so handlers, callbacks and host
//! setters may publish re-entrantly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use super::dynamic_property::{
    resolve_template, DynamicPropertyDescriptor, DynamicPropertySpec, DynamicPropertyUpdater,
    StateMap, UpdateOutcome,
};
use super::host::{HostEvent, StateHost};
use crate::events::bus::{HandlerId, StateBus};
use crate::events::messages::{
    ParticipantRef, PropertyChange, StateInitRequestMessage, StateUpdateMessage,
};
use crate::utilities::merge_fields::extract_from_value;

const LOG_TARGET: &str = "state_sync::participant";

/// Catch-all consumer of incoming property updates.
pub type StateUpdateCallback = Rc<dyn Fn(&StateParticipant, &PropertyChange)>;

/// Errors raised by participant lifecycle operations.
#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("participant {0} is already listening")]
    AlreadyListening(ParticipantRef),
}

/// Lifecycle status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Created,
    Registering,
    Listening,
    Terminated,
}

// ---------------------------------------------------------------------------
// StartOptions
// ---------------------------------------------------------------------------

/// Options for [`StateParticipant::start`].
#[derive(Default, Clone)]
pub struct StartOptions {
    /// Host properties to treat as dynamic.
    pub dynamic_properties: Vec<DynamicPropertySpec>,
    /// Receives every incoming update regardless of merge fields.
    pub state_update_callback: Option<StateUpdateCallback>,
    /// Display name; defaults to the host's type name.
    pub context_name: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dynamic_property(mut self, spec: DynamicPropertySpec) -> Self {
        self.dynamic_properties.push(spec);
        self
    }

    pub fn dynamic_properties(mut self, specs: impl IntoIterator<Item = DynamicPropertySpec>) -> Self {
        self.dynamic_properties.extend(specs);
        self
    }

    pub fn on_state_update(
        mut self,
        callback: impl Fn(&StateParticipant, &PropertyChange) + 'static,
    ) -> Self {
        self.state_update_callback = Some(Rc::new(callback));
        self
    }

    pub fn context_name(mut self, name: impl Into<String>) -> Self {
        self.context_name = Some(name.into());
        self
    }
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("dynamic_properties", &self.dynamic_properties)
            .field("state_update_callback", &self.state_update_callback.is_some())
            .field("context_name", &self.context_name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Subscriptions {
    update: HandlerId,
    init_request: HandlerId,
}

struct ParticipantState {
    name: String,
    status: ParticipantStatus,
    initialized: bool,
    /// Values this participant itself published, in first-publish order.
    internal_state: IndexMap<String, Value>,
    /// Values learned from others plus ambient host context.
    external_state: StateMap,
    dynamic_properties: Vec<DynamicPropertyDescriptor>,
    /// Merge field name to the template that mentions it.
    monitored_fields: HashMap<String, String>,
    monitor_all: bool,
    state_update_callback: Option<StateUpdateCallback>,
    subscriptions: Option<Subscriptions>,
}

struct ParticipantInner {
    id: u64,
    bus: StateBus,
    host: Rc<dyn StateHost>,
    state: RefCell<ParticipantState>,
}

impl Drop for ParticipantInner {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.state.get_mut().subscriptions.take() {
            self.bus.off::<StateUpdateMessage>(&subscriptions.update);
            self.bus.off::<StateInitRequestMessage>(&subscriptions.init_request);
        }
    }
}

// ---------------------------------------------------------------------------
// StateParticipant
// ---------------------------------------------------------------------------

/// One element's window onto the shared state. Cloning yields another
/// handle to the same participant.
#[derive(Clone)]
pub struct StateParticipant {
    inner: Rc<ParticipantInner>,
}

impl StateParticipant {
    /// Create a participant for `host`, drawing its id from `bus`.
    pub fn new(bus: &StateBus, host: Rc<dyn StateHost>) -> Self {
        let id = bus.allocate_id();
        let name = host.type_name().to_string();
        Self {
            inner: Rc::new(ParticipantInner {
                id,
                bus: bus.clone(),
                host,
                state: RefCell::new(ParticipantState {
                    name,
                    status: ParticipantStatus::Created,
                    initialized: false,
                    internal_state: IndexMap::new(),
                    external_state: StateMap::new(),
                    dynamic_properties: Vec::new(),
                    monitored_fields: HashMap::new(),
                    monitor_all: false,
                    state_update_callback: None,
                    subscriptions: None,
                }),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.state.borrow().name.clone()
    }

    /// Identity as carried in bus messages.
    pub fn identity(&self) -> ParticipantRef {
        ParticipantRef::new(self.name(), self.inner.id)
    }

    pub fn status(&self) -> ParticipantStatus {
        self.inner.state.borrow().status
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.borrow().initialized
    }

    pub fn is_monitoring_all(&self) -> bool {
        self.inner.state.borrow().monitor_all
    }

    pub fn bus(&self) -> &StateBus {
        &self.inner.bus
    }

    pub fn host(&self) -> Rc<dyn StateHost> {
        self.inner.host.clone()
    }

    /// Values this participant has published, in first-publish order.
    pub fn internal_state(&self) -> IndexMap<String, Value> {
        self.inner.state.borrow().internal_state.clone()
    }

    /// The last value this participant published for `name`.
    pub fn published_value(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().internal_state.get(name).cloned()
    }

    pub fn external_state(&self) -> StateMap {
        self.inner.state.borrow().external_state.clone()
    }

    pub fn external_value(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().external_state.get(name).cloned()
    }

    pub fn dynamic_properties(&self) -> Vec<DynamicPropertyDescriptor> {
        self.inner.state.borrow().dynamic_properties.clone()
    }

    pub fn monitored_fields(&self) -> HashMap<String, String> {
        self.inner.state.borrow().monitored_fields.clone()
    }

    pub fn is_field_monitored(&self, name: &str) -> bool {
        self.inner.state.borrow().monitored_fields.contains_key(name)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start state handling.
    ///
    /// A stopped participant may be started again; its dynamic properties
    /// keep the templates captured on the first start.
    pub fn start(&self, options: StartOptions) -> Result<(), ParticipantError> {
        if self.status() == ParticipantStatus::Listening {
            return Err(ParticipantError::AlreadyListening(self.identity()));
        }

        let host = self.inner.host.clone();
        let context = host.context();
        let raw_values: Vec<(DynamicPropertySpec, Option<Value>)> = options
            .dynamic_properties
            .into_iter()
            .map(|spec| {
                let raw = host.property(&spec.name);
                (spec, raw)
            })
            .collect();

        {
            let mut state = self.inner.state.borrow_mut();
            state.status = ParticipantStatus::Registering;
            state.name = options
                .context_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| host.type_name().to_string());
            for (key, value) in context.entries() {
                state.external_state.insert(key.to_string(), value);
            }
            for (spec, raw) in &raw_values {
                register_dynamic_property(&mut state, spec, raw.as_ref());
            }
            if let Some(callback) = options.state_update_callback {
                state.monitor_all = true;
                state.state_update_callback = Some(callback);
            }
        }
        self.log_registration();

        self.update_dynamic_properties_from_state();
        self.inner.state.borrow_mut().initialized = true;
        host.dispatch_event(HostEvent::Initialize);

        self.subscribe();
        self.request_state_init();
        Ok(())
    }

    /// Stop state handling: unsubscribe from both channels.
    pub fn stop(&self) {
        let subscriptions = {
            let mut state = self.inner.state.borrow_mut();
            if state.status != ParticipantStatus::Created {
                state.status = ParticipantStatus::Terminated;
            }
            state.subscriptions.take()
        };
        if let Some(subscriptions) = subscriptions {
            self.inner.bus.off::<StateUpdateMessage>(&subscriptions.update);
            self.inner
                .bus
                .off::<StateInitRequestMessage>(&subscriptions.init_request);
            log::debug!(target: LOG_TARGET, "{}: state handling stopped", self.identity());
        }
    }

    fn subscribe(&self) {
        let identity = self.identity();
        let id = self.inner.id;

        let weak: Weak<ParticipantInner> = Rc::downgrade(&self.inner);
        let update = self.inner.bus.on::<StateUpdateMessage>(
            format!("{}:update", identity),
            move |message| {
                if message.publisher.id == id {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    StateParticipant { inner }.handle_state_update(message);
                }
            },
        );

        let weak: Weak<ParticipantInner> = Rc::downgrade(&self.inner);
        let init_request = self.inner.bus.on::<StateInitRequestMessage>(
            format!("{}:init-request", identity),
            move |message| {
                if message.requester.id == id {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    StateParticipant { inner }.handle_state_init_request(message);
                }
            },
        );

        let mut state = self.inner.state.borrow_mut();
        state.subscriptions = Some(Subscriptions {
            update,
            init_request,
        });
        state.status = ParticipantStatus::Listening;
    }

    fn request_state_init(&self) {
        let requester = self.identity();
        log::debug!(target: LOG_TARGET, "Request State Init: {} -> All", requester);
        self.inner
            .bus
            .publish(&StateInitRequestMessage { requester });
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Record `value` as this participant's own and broadcast it.
    ///
    /// Publishing before initialization is logged but not blocked. Returns
    /// the number of bus handlers that received the message.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> usize {
        let name = name.into();
        let value = value.into();
        let publisher = {
            let mut state = self.inner.state.borrow_mut();
            if !state.initialized {
                log::warn!(
                    target: LOG_TARGET,
                    "{}:id-{}: publishing {} before state initialization completed",
                    state.name,
                    self.inner.id,
                    name
                );
            }
            state.internal_state.insert(name.clone(), value.clone());
            ParticipantRef::new(state.name.clone(), self.inner.id)
        };
        log::debug!(
            target: LOG_TARGET,
            "Publish State Update: {} -> All [{}: {}]",
            publisher,
            name,
            value
        );
        self.inner.bus.publish(&StateUpdateMessage {
            property: PropertyChange::new(name, value),
            publisher,
        })
    }

    // -----------------------------------------------------------------------
    // Incoming messages
    // -----------------------------------------------------------------------

    /// Apply an incoming update.
    ///
    /// The catch-all callback runs first; then, if the name is a monitored
    /// merge field, it is stored in the external state and every dynamic
    /// property is re-resolved. Both may fire for the same message.
    pub fn handle_state_update(&self, message: &StateUpdateMessage) {
        if message.publisher.id == self.inner.id {
            return;
        }
        let property = &message.property;

        let callback = {
            let state = self.inner.state.borrow();
            if state.monitor_all {
                state.state_update_callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            log::debug!(
                target: LOG_TARGET,
                "Handle State Change: {} -> {}",
                message.publisher,
                self.identity()
            );
            callback(self, property);
        }

        if self.is_field_monitored(&property.name) {
            log::debug!(
                target: LOG_TARGET,
                "Handle State Change: {} -> {} [{}: {}]",
                message.publisher,
                self.identity(),
                property.name,
                property.value
            );
            self.record_external(property.name.clone(), property.value.clone());
            self.update_dynamic_properties_from_state();
        }
    }

    /// Answer another participant's init request by re-publishing every
    /// value this participant has published.
    pub fn handle_state_init_request(&self, message: &StateInitRequestMessage) {
        if message.requester.id == self.inner.id {
            return;
        }
        let published: Vec<(String, Value)> = self
            .inner
            .state
            .borrow()
            .internal_state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        log::debug!(
            target: LOG_TARGET,
            "Handle State Init Request: {} -> {} ({} value(s))",
            message.requester,
            self.identity(),
            published.len()
        );
        for (name, value) in published {
            self.publish(name, value);
        }
    }

    // -----------------------------------------------------------------------
    // State access for consumers
    // -----------------------------------------------------------------------

    /// Store a value in the external state without re-resolving.
    pub fn record_external(&self, name: impl Into<String>, value: Value) {
        self.inner
            .state
            .borrow_mut()
            .external_state
            .insert(name.into(), value);
    }

    /// Re-resolve every dynamic property against the external state.
    pub fn update_dynamic_properties_from_state(&self) -> Vec<UpdateOutcome> {
        let (descriptors, external) = {
            let state = self.inner.state.borrow();
            (state.dynamic_properties.clone(), state.external_state.clone())
        };
        let log_skipped = self.inner.bus.config().log_skipped_updates;
        descriptors
            .iter()
            .map(|descriptor| {
                DynamicPropertyUpdater::new(self.inner.host.as_ref(), descriptor)
                    .with_skip_logging(log_skipped)
                    .update_target_from_state(&external)
            })
            .collect()
    }

    /// Resolve an ad-hoc template against the external state.
    ///
    /// Returns `None` when the template holds no merge field.
    pub fn resolve_template(&self, template: &str, empty_if_not_resolvable: bool) -> Option<Value> {
        let descriptor = DynamicPropertyDescriptor::new("", Some(template.to_string()))
            .with_empty_if_not_resolvable(empty_if_not_resolvable);
        let state = self.inner.state.borrow();
        resolve_template(&descriptor, &state.external_state).map(|r| r.into_value())
    }

    fn log_registration(&self) {
        let state = self.inner.state.borrow();
        let properties = if state.monitor_all && state.monitored_fields.is_empty() {
            "All".to_string()
        } else {
            let mut fields: Vec<&str> = state.monitored_fields.keys().map(String::as_str).collect();
            fields.sort_unstable();
            fields.join(", ")
        };
        log::debug!(
            target: LOG_TARGET,
            "Dynamic Properties registered and initialized: {}:id-{} [{}]",
            state.name,
            self.inner.id,
            properties
        );
    }
}

/// Register `spec` if the host's current value holds at least one merge field.
fn register_dynamic_property(
    state: &mut ParticipantState,
    spec: &DynamicPropertySpec,
    raw: Option<&Value>,
) {
    if state.dynamic_properties.iter().any(|d| d.name == spec.name) {
        return;
    }
    let fields = extract_from_value(raw);
    if fields.is_empty() {
        return;
    }
    let Some(template) = raw.and_then(Value::as_str) else {
        return;
    };
    state
        .dynamic_properties
        .push(DynamicPropertyDescriptor::from_spec(spec, template));
    for field in fields {
        state.monitored_fields.insert(field, template.to_string());
    }
}

impl fmt::Debug for StateParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("StateParticipant")
            .field("id", &self.inner.id)
            .field("name", &state.name)
            .field("status", &state.status)
            .field("initialized", &state.initialized)
            .field("internal_state", &state.internal_state)
            .field("external_state", &state.external_state)
            .field("dynamic_properties", &state.dynamic_properties)
            .field("monitor_all", &state.monitor_all)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::host::{HostContext, MemoryHost};
    use serde_json::json;
    use std::cell::Cell;

    fn participant(bus: &StateBus, host: MemoryHost) -> (StateParticipant, Rc<MemoryHost>) {
        let host = Rc::new(host);
        (StateParticipant::new(bus, host.clone()), host)
    }

    fn greeting_host() -> MemoryHost {
        MemoryHost::new("Greeter").with_property("greeting", "static {userName}")
    }

    fn recorder(bus: &StateBus) -> Rc<RefCell<Vec<StateUpdateMessage>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        bus.on::<StateUpdateMessage>("recorder", move |m| s.borrow_mut().push(m.clone()));
        seen
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let bus = StateBus::new();
        let (a, _) = participant(&bus, MemoryHost::new("A"));
        let (b, _) = participant(&bus, MemoryHost::new("B"));
        assert!(b.id() > a.id());
        assert_eq!(a.name(), "A");
    }

    #[test]
    fn test_init_with_null() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, greeting_host());
        a.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("greeting")))
            .unwrap();
        assert_eq!(host.get("greeting"), Some(Value::Null));
        assert!(a.is_initialized());
        assert_eq!(a.status(), ParticipantStatus::Listening);
        assert_eq!(host.events(), vec![HostEvent::Initialize]);
    }

    #[test]
    fn test_init_with_empty_value() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, greeting_host());
        a.start(
            StartOptions::new()
                .dynamic_property(DynamicPropertySpec::new("greeting").empty_if_not_resolvable()),
        )
        .unwrap();
        assert_eq!(host.get("greeting"), Some(json!("")));
    }

    #[test]
    fn test_static_property_is_not_registered() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, MemoryHost::new("A").with_property("title", "Plain"));
        a.start(
            StartOptions::new()
                .dynamic_property(DynamicPropertySpec::new("title"))
                .dynamic_property(DynamicPropertySpec::new("absent")),
        )
        .unwrap();
        assert!(a.dynamic_properties().is_empty());
        assert!(a.monitored_fields().is_empty());
        assert_eq!(host.get("title"), Some(json!("Plain")));
        assert_eq!(host.write_count("title"), 0);
    }

    #[test]
    fn test_registration_records_fields() {
        let bus = StateBus::new();
        let template = "AccountId in ({selectedAccountIds}) AND Country='{country}'";
        let (a, _) = participant(&bus, MemoryHost::new("Table").with_property("criteria", template));
        a.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("criteria")))
            .unwrap();

        let descriptors = a.dynamic_properties();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].original_value.as_deref(), Some(template));
        let monitored = a.monitored_fields();
        assert_eq!(monitored.get("selectedAccountIds").map(String::as_str), Some(template));
        assert_eq!(monitored.get("country").map(String::as_str), Some(template));
    }

    #[test]
    fn test_context_name_and_ambient_context() {
        let bus = StateBus::new();
        let host = MemoryHost::new("RecordPanel")
            .with_property("title", "Record {recordId}")
            .with_context(HostContext::new().with_object_api_name("Account").with_record_id("001"));
        let (a, host) = participant(&bus, host);
        a.start(
            StartOptions::new()
                .dynamic_property(DynamicPropertySpec::new("title"))
                .context_name("Detail"),
        )
        .unwrap();

        assert_eq!(a.name(), "Detail");
        assert_eq!(a.external_value("objectApiName"), Some(json!("Account")));
        assert_eq!(host.get("title"), Some(json!("Record 001")));
    }

    #[test]
    fn test_start_broadcasts_init_request() {
        let bus = StateBus::new();
        let requests = Rc::new(RefCell::new(Vec::new()));
        let r = requests.clone();
        bus.on::<StateInitRequestMessage>("spy", move |m| r.borrow_mut().push(m.clone()));

        let (a, _) = participant(&bus, greeting_host());
        a.start(StartOptions::new()).unwrap();
        assert_eq!(
            *requests.borrow(),
            vec![StateInitRequestMessage {
                requester: a.identity()
            }]
        );
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let bus = StateBus::new();
        let (a, _) = participant(&bus, greeting_host());
        a.start(StartOptions::new()).unwrap();
        let err = a.start(StartOptions::new()).unwrap_err();
        assert!(matches!(err, ParticipantError::AlreadyListening(_)));
        assert_eq!(bus.subscriber_count::<StateUpdateMessage>(), 1);
    }

    #[test]
    fn test_publish_broadcasts_and_records() {
        let bus = StateBus::new();
        let seen = recorder(&bus);
        let (b, _) = participant(&bus, MemoryHost::new("Picker"));
        b.start(StartOptions::new()).unwrap();
        b.publish("region", "EU");

        assert_eq!(b.published_value("region"), Some(json!("EU")));
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].property, PropertyChange::new("region", json!("EU")));
        assert_eq!(seen[0].publisher, b.identity());
    }

    #[test]
    fn test_publish_before_start_is_not_blocked() {
        let bus = StateBus::new();
        let seen = recorder(&bus);
        let (b, _) = participant(&bus, MemoryHost::new("Picker"));
        assert!(!b.is_initialized());
        assert_eq!(b.publish("x", 1), 1);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_scenario_template_resolves_on_publish() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, greeting_host());
        let (b, _) = participant(&bus, MemoryHost::new("Profile"));
        a.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("greeting")))
            .unwrap();
        b.start(StartOptions::new()).unwrap();

        assert_eq!(host.get("greeting"), Some(Value::Null));
        b.publish("userName", "Ann");
        assert_eq!(host.get("greeting"), Some(json!("static Ann")));
        assert_eq!(a.external_value("userName"), Some(json!("Ann")));
    }

    #[test]
    fn test_scenario_identical_publish_writes_once() {
        let bus = StateBus::new();
        let seen = recorder(&bus);
        let (a, host) = participant(&bus, MemoryHost::new("A").with_property("label", "v{x}"));
        let (b, _) = participant(&bus, MemoryHost::new("B"));
        a.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("label")))
            .unwrap();
        b.start(StartOptions::new()).unwrap();
        let writes_after_start = host.write_count("label");

        b.publish("x", 1);
        b.publish("x", 1);

        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(host.write_count("label"), writes_after_start + 1);
        assert_eq!(host.get("label"), Some(json!("v1")));
    }

    #[test]
    fn test_scenario_late_starter_learns_existing_state() {
        let bus = StateBus::new();
        let (a, _) = participant(&bus, MemoryHost::new("RegionPicker"));
        a.start(StartOptions::new()).unwrap();
        a.publish("region", "EU");

        let (c, host) = participant(&bus, MemoryHost::new("Report").with_property("title", "Sales {region}"));
        c.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("title")))
            .unwrap();
        assert_eq!(host.get("title"), Some(json!("Sales EU")));
    }

    #[test]
    fn test_fan_out_completeness() {
        let bus = StateBus::new();
        let mut others = Vec::new();
        for i in 0..3 {
            let (p, _) = participant(&bus, MemoryHost::new(format!("P{}", i)));
            p.start(StartOptions::new()).unwrap();
            p.publish(format!("a{}", i), i);
            p.publish(format!("b{}", i), i);
            p.publish(format!("a{}", i), i + 10);
            others.push(p);
        }

        let received = Rc::new(RefCell::new(Vec::new()));
        let r = received.clone();
        let (late, _) = participant(&bus, MemoryHost::new("Late"));
        late.start(StartOptions::new().on_state_update(move |_, change| {
            r.borrow_mut().push(change.clone());
        }))
        .unwrap();

        let received = received.borrow();
        assert_eq!(received.len(), 6);
        for i in 0..3 {
            assert!(received.contains(&PropertyChange::new(format!("a{}", i), json!(i + 10))));
            assert!(received.contains(&PropertyChange::new(format!("b{}", i), json!(i))));
        }
    }

    #[test]
    fn test_no_self_reaction() {
        let bus = StateBus::new();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let (a, host) = participant(&bus, MemoryHost::new("A").with_property("label", "{x}"));
        a.start(
            StartOptions::new()
                .dynamic_property(DynamicPropertySpec::new("label"))
                .on_state_update(move |_, _| c.set(c.get() + 1)),
        )
        .unwrap();

        a.publish("x", "mine");
        a.handle_state_update(&StateUpdateMessage {
            property: PropertyChange::new("x", json!("forged")),
            publisher: a.identity(),
        });
        assert_eq!(calls.get(), 0);
        assert_eq!(host.get("label"), Some(Value::Null));
        assert_eq!(a.external_value("x"), None);
    }

    #[test]
    fn test_own_init_request_is_ignored() {
        let bus = StateBus::new();
        let seen = recorder(&bus);
        let (a, _) = participant(&bus, MemoryHost::new("A"));
        a.start(StartOptions::new()).unwrap();
        a.publish("x", 1);
        seen.borrow_mut().clear();

        bus.publish(&StateInitRequestMessage {
            requester: a.identity(),
        });
        assert!(seen.borrow().is_empty());

        bus.publish(&StateInitRequestMessage {
            requester: ParticipantRef::new("Other", a.id() + 100),
        });
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].publisher, a.identity());
    }

    #[test]
    fn test_callback_runs_before_monitored_update() {
        let bus = StateBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let host = Rc::new(MemoryHost::new("A").with_property("label", "{x}"));
        let a = StateParticipant::new(&bus, host.clone());
        let o = order.clone();
        let h = host.clone();
        a.start(
            StartOptions::new()
                .dynamic_property(DynamicPropertySpec::new("label"))
                .on_state_update(move |_, change| {
                    o.borrow_mut().push(format!("callback {} label={}", change.name, h.get("label").unwrap()));
                }),
        )
        .unwrap();

        let (b, _) = participant(&bus, MemoryHost::new("B"));
        b.start(StartOptions::new()).unwrap();
        b.publish("x", "1");
        b.publish("unrelated", "2");

        assert_eq!(
            *order.borrow(),
            vec!["callback x label=null", "callback unrelated label=\"1\""]
        );
        assert_eq!(host.get("label"), Some(json!("1")));
        assert_eq!(a.external_value("unrelated"), None);
    }

    #[test]
    fn test_callback_may_publish() {
        let bus = StateBus::new();
        let (relay, _) = participant(&bus, MemoryHost::new("Relay"));
        relay
            .start(StartOptions::new().on_state_update(|me, change| {
                if change.name == "country" {
                    let upper = change.value.as_str().unwrap_or_default().to_uppercase();
                    me.publish("countryCode", upper);
                }
            }))
            .unwrap();

        let (view, host) = participant(&bus, MemoryHost::new("View").with_property("label", "[{countryCode}]"));
        view.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("label")))
            .unwrap();
        let (source, _) = participant(&bus, MemoryHost::new("Source"));
        source.start(StartOptions::new()).unwrap();

        source.publish("country", "de");
        assert_eq!(host.get("label"), Some(json!("[DE]")));
    }

    #[test]
    fn test_stop_unsubscribes_both_channels() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, greeting_host());
        a.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("greeting")))
            .unwrap();
        a.publish("held", 1);
        a.stop();

        assert_eq!(a.status(), ParticipantStatus::Terminated);
        assert_eq!(bus.subscriber_count::<StateUpdateMessage>(), 0);
        assert_eq!(bus.subscriber_count::<StateInitRequestMessage>(), 0);

        let (b, _) = participant(&bus, MemoryHost::new("B"));
        let seen = recorder(&bus);
        b.start(StartOptions::new()).unwrap();
        b.publish("userName", "Ann");
        assert_eq!(host.get("greeting"), Some(Value::Null));
        assert!(seen.borrow().iter().all(|m| m.publisher.id != a.id()));
    }

    #[test]
    fn test_restart_keeps_templates() {
        let bus = StateBus::new();
        let (a, host) = participant(&bus, greeting_host());
        let (b, _) = participant(&bus, MemoryHost::new("B"));
        b.start(StartOptions::new()).unwrap();

        let options = StartOptions::new().dynamic_property(DynamicPropertySpec::new("greeting"));
        a.start(options.clone()).unwrap();
        b.publish("userName", "Ann");
        a.stop();
        a.start(options).unwrap();

        assert_eq!(a.dynamic_properties().len(), 1);
        assert_eq!(host.get("greeting"), Some(json!("static Ann")));
        b.publish("userName", "Bob");
        assert_eq!(host.get("greeting"), Some(json!("static Bob")));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = StateBus::new();
        {
            let (a, _) = participant(&bus, greeting_host());
            a.start(StartOptions::new()).unwrap();
            assert_eq!(bus.subscriber_count::<StateUpdateMessage>(), 1);
        }
        assert_eq!(bus.subscriber_count::<StateUpdateMessage>(), 0);
        assert_eq!(bus.subscriber_count::<StateInitRequestMessage>(), 0);
    }

    #[test]
    fn test_resolve_template_against_external_state() {
        let bus = StateBus::new();
        let (a, _) = participant(&bus, MemoryHost::new("A"));
        a.record_external("x", json!("1"));
        assert_eq!(a.resolve_template("v{x}", true), Some(json!("v1")));
        assert_eq!(a.resolve_template("v{y}", true), Some(json!("")));
        assert_eq!(a.resolve_template("v{y}", false), Some(Value::Null));
        assert_eq!(a.resolve_template("static", true), None);
    }
}
