//! Declarative address map.
//!
//! Shows one marker per record whose address field is set. The object type,
//! the address field and the record ids are merge-field templates, typically
//! bound to a record list's published selection (`'id1','id2'`). Whenever the
//! markers are recalculated the selected marker value is reset to `""`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::record_list::{Record, RecordQuery, RecordQueryService, RefreshOutcome};
use super::{EventLog, QueryTracker, LOG_TARGET, QUERY_CHANGE};
use crate::events::StateBus;
use crate::state::{
    DynamicPropertySpec, HostContext, HostEvent, ParticipantError, StartOptions, StateHost,
    StateParticipant,
};
use crate::utilities::merge_fields::render_value;

pub const CARD_TITLE: &str = "card_title";
pub const OBJECT_NAME: &str = "object_name";
pub const ADDRESS_FIELD_NAME: &str = "address_field_name";
pub const RECORD_IDS: &str = "record_ids";

/// Event dispatched to the host when a marker is selected.
pub const MARKER_SELECT: &str = "markerselect";

/// Postal location of a marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerLocation {
    pub street: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// One map marker; `value` is the record id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub value: String,
    pub title: String,
    pub location: MarkerLocation,
}

impl Marker {
    /// Build a marker from `record`, `None` unless its address field is a
    /// compound address.
    fn from_record(record: &Record, address_field: &str) -> Option<Self> {
        let address = record.get(address_field).filter(|a| a.is_object())?;
        let part = |key: &str| {
            address
                .get(key)
                .map(render_value)
                .filter(|s| !s.is_empty())
        };
        Some(Self {
            value: record.get("Id").map(render_value).unwrap_or_default(),
            title: record.get("Name").map(render_value).unwrap_or_default(),
            location: MarkerLocation {
                street: part("street"),
                city: part("city"),
                country: part("country"),
            },
        })
    }
}

/// Initial configuration of an address map. Every input may hold merge fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressMapSettings {
    pub card_title: String,
    pub object_name: String,
    pub address_field_name: String,
    /// Quoted, comma-separated ids, e.g. `'001A','001B'`.
    pub record_ids: String,
    /// Property under which the selected marker value is published.
    pub selected_marker_value_property: Option<String>,
    pub context: HostContext,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

struct AddressMapHost {
    card_title: RefCell<Value>,
    object_name: RefCell<Value>,
    address_field_name: RefCell<Value>,
    record_ids: RefCell<Value>,
    context: HostContext,
    markers: RefCell<Vec<Marker>>,
    queries: QueryTracker,
    loading: Cell<bool>,
    events: EventLog,
}

impl AddressMapHost {
    fn slot(&self, name: &str) -> Option<&RefCell<Value>> {
        match name {
            CARD_TITLE => Some(&self.card_title),
            OBJECT_NAME => Some(&self.object_name),
            ADDRESS_FIELD_NAME => Some(&self.address_field_name),
            RECORD_IDS => Some(&self.record_ids),
            _ => None,
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        let text = render_value(&self.slot(name)?.borrow());
        (!text.is_empty()).then_some(text)
    }
}

impl StateHost for AddressMapHost {
    fn type_name(&self) -> &str {
        "DeclarativeAddressMap"
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.slot(name).map(|slot| slot.borrow().clone())
    }

    fn set_property(&self, name: &str, value: Value) {
        let Some(slot) = self.slot(name) else {
            log::warn!(target: LOG_TARGET, "DeclarativeAddressMap: unknown property '{}'", name);
            return;
        };
        *slot.borrow_mut() = value;
        if name == CARD_TITLE {
            return;
        }
        let identifier = self.queries.bump();
        self.events
            .push(HostEvent::custom(QUERY_CHANGE, json!({ "queryIdentifier": identifier })));
    }

    fn context(&self) -> HostContext {
        self.context.clone()
    }

    fn dispatch_event(&self, event: HostEvent) {
        self.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// DeclarativeAddressMap
// ---------------------------------------------------------------------------

pub struct DeclarativeAddressMap {
    settings: AddressMapSettings,
    host: Rc<AddressMapHost>,
    participant: StateParticipant,
}

impl DeclarativeAddressMap {
    pub fn new(bus: &StateBus, settings: AddressMapSettings) -> Self {
        let text = |s: &str| RefCell::new(Value::String(s.to_string()));
        let host = Rc::new(AddressMapHost {
            card_title: text(&settings.card_title),
            object_name: text(&settings.object_name),
            address_field_name: text(&settings.address_field_name),
            record_ids: text(&settings.record_ids),
            context: settings.context.clone(),
            markers: RefCell::new(Vec::new()),
            queries: QueryTracker::default(),
            loading: Cell::new(false),
            events: EventLog::default(),
        });
        let participant = StateParticipant::new(bus, host.clone());
        Self {
            settings,
            host,
            participant,
        }
    }

    pub fn participant(&self) -> &StateParticipant {
        &self.participant
    }

    pub fn connect(&self) -> Result<(), ParticipantError> {
        self.participant.start(StartOptions::new().dynamic_properties(
            [CARD_TITLE, OBJECT_NAME, ADDRESS_FIELD_NAME, RECORD_IDS]
                .into_iter()
                .map(|name| DynamicPropertySpec::new(name).empty_if_not_resolvable()),
        ))
    }

    pub fn disconnect(&self) {
        self.participant.stop();
    }

    pub fn card_title(&self) -> String {
        self.host.text(CARD_TITLE).unwrap_or_default()
    }

    /// Current value of an input.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.host.property(name)
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.host.markers.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.host.loading.get()
    }

    /// Whether an input changed since the last completed refresh.
    pub fn needs_refresh(&self) -> bool {
        self.host.queries.needs_refresh()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.host.events.snapshot()
    }

    pub fn drain_events(&self) -> Vec<HostEvent> {
        self.host.events.drain()
    }

    /// The marker query the current inputs describe, `None` when incomplete.
    pub fn current_query(&self) -> Option<RecordQuery> {
        if !self.participant.is_initialized() {
            return None;
        }
        let object_name = self.host.text(OBJECT_NAME)?;
        let address_field = self.host.text(ADDRESS_FIELD_NAME)?;
        let record_ids = self.host.text(RECORD_IDS)?;
        let ids = record_ids.trim();
        let criteria = if ids.starts_with('(') {
            format!("Id IN {}", ids)
        } else {
            format!("Id IN ({})", ids)
        };
        Some(RecordQuery {
            object_name,
            fields: format!("Name, {}", address_field),
            criteria: Some(criteria),
            record_limit: None,
        })
    }

    /// Recalculate the markers from the current inputs.
    pub async fn refresh(&self, service: &dyn RecordQueryService) -> RefreshOutcome {
        let ticket = self.host.queries.current();
        let Some(query) = self.current_query() else {
            self.host.markers.borrow_mut().clear();
            self.host.queries.settle(ticket);
            return RefreshOutcome::Skipped;
        };

        log::debug!(
            target: LOG_TARGET,
            "-> calculateMarkers: {} {:?} (query {})",
            self.participant.identity(),
            query,
            ticket
        );
        self.host.loading.set(true);
        let result = service.get_records(&query).await;
        self.host.loading.set(false);

        match result {
            Ok(records) if self.host.queries.is_current(ticket) => {
                let address_field = self.host.text(ADDRESS_FIELD_NAME).unwrap_or_default();
                let markers: Vec<Marker> = records
                    .iter()
                    .filter_map(|r| Marker::from_record(r, &address_field))
                    .collect();
                let count = markers.len();
                *self.host.markers.borrow_mut() = markers;
                self.host.queries.settle(ticket);
                if let Some(property) = &self.settings.selected_marker_value_property {
                    self.participant.publish(property.clone(), "");
                }
                RefreshOutcome::Loaded(count)
            }
            Ok(_) => {
                log::debug!(
                    target: LOG_TARGET,
                    "{}: dropping stale markers for query {}",
                    self.participant.identity(),
                    ticket
                );
                RefreshOutcome::Stale
            }
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "Address map query error: {}: {}",
                    self.participant.identity(),
                    err
                );
                self.host
                    .dispatch_event(HostEvent::error_toast("Error", err.to_string()));
                self.host.queries.settle(ticket);
                RefreshOutcome::Failed(err)
            }
        }
    }

    /// Select the marker whose value is `value` and publish it.
    pub fn select_marker(&self, value: &str) {
        self.host.dispatch_event(HostEvent::custom(
            MARKER_SELECT,
            json!({ "selectedMarkerValue": value }),
        ));
        if let Some(property) = &self.settings.selected_marker_value_property {
            self.participant.publish(property.clone(), value);
        }
    }
}
