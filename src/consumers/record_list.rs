//! Declarative record list.
//!
//! A table whose query inputs (`object_name`, `fields`, `criteria`,
//! `record_limit`) are merge-field templates. Every write to an input bumps
//! the query identifier and dispatches a `querychange` event to the host,
//! which answers with [`DeclarativeRecordList::refresh`]. A response is only
//! applied if no input changed while it was in flight.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{EventLog, QueryTracker, ServiceError, LOG_TARGET, QUERY_CHANGE};
use crate::events::StateBus;
use crate::state::{
    DynamicPropertySpec, HostContext, HostEvent, ParticipantError, StartOptions, StateHost,
    StateParticipant,
};
use crate::utilities::merge_fields::render_value;

pub const OBJECT_NAME: &str = "object_name";
pub const FIELDS: &str = "fields";
pub const CRITERIA: &str = "criteria";
pub const RECORD_LIMIT: &str = "record_limit";

/// Event dispatched to the host when the row selection changes.
pub const RECORD_SELECTION_CHANGE: &str = "recordselectionchange";

/// A row as returned by a [`RecordQueryService`].
pub type Record = Map<String, Value>;

/// Parameters of one record query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub object_name: String,
    /// Comma-separated field list, passed through as configured.
    pub fields: String,
    pub criteria: Option<String>,
    pub record_limit: Option<u64>,
}

/// Executes record queries.
#[async_trait(?Send)]
pub trait RecordQueryService {
    async fn get_records(&self, query: &RecordQuery) -> Result<Vec<Record>, ServiceError>;
}

/// A query service serving fixed rows per object name.
///
/// Criteria are recorded but not evaluated; the record limit is applied.
#[derive(Debug, Default)]
pub struct InMemoryRecordService {
    tables: HashMap<String, Vec<Record>>,
    failure: Option<String>,
    queries: RefCell<Vec<RecordQuery>>,
}

impl InMemoryRecordService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rows for an object. Each value must be a JSON object.
    pub fn with_records(mut self, object_name: impl Into<String>, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.tables.insert(object_name.into(), rows);
        self
    }

    /// Make every query fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<RecordQuery> {
        self.queries.borrow().clone()
    }
}

#[async_trait(?Send)]
impl RecordQueryService for InMemoryRecordService {
    async fn get_records(&self, query: &RecordQuery) -> Result<Vec<Record>, ServiceError> {
        self.queries.borrow_mut().push(query.clone());
        if let Some(message) = &self.failure {
            return Err(ServiceError::Failed(message.clone()));
        }
        let rows = self
            .tables
            .get(&query.object_name)
            .ok_or_else(|| ServiceError::NotFound {
                kind: "object".to_string(),
                name: query.object_name.clone(),
            })?;
        let limit = query
            .record_limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(rows.len());
        Ok(rows.iter().take(limit).cloned().collect())
    }
}

/// A table column derived from the field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub label: String,
    pub field_name: String,
}

/// Initial configuration of a record list.
///
/// The four query inputs may hold merge fields; inputs without one stay
/// static.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordListSettings {
    pub object_name: String,
    pub fields: String,
    pub criteria: String,
    pub record_limit: String,
    pub show_all_when_criteria_missing: bool,
    /// Property under which selected ids are published.
    pub selected_record_ids_property: Option<String>,
    pub context: HostContext,
}

/// Result of a [`DeclarativeRecordList::refresh`].
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Inputs incomplete; records were cleared without querying.
    Skipped,
    /// The response was applied.
    Loaded(usize),
    /// An input changed while the query was in flight; the response was dropped.
    Stale,
    /// The query failed; records are unchanged.
    Failed(ServiceError),
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

struct RecordListHost {
    object_name: RefCell<Value>,
    fields: RefCell<Value>,
    criteria: RefCell<Value>,
    record_limit: RefCell<Value>,
    context: HostContext,
    columns: RefCell<Vec<Column>>,
    records: RefCell<Vec<Record>>,
    selected_record_ids: RefCell<Vec<String>>,
    queries: QueryTracker,
    loading: Cell<bool>,
    events: EventLog,
}

impl RecordListHost {
    fn new(settings: &RecordListSettings) -> Self {
        let host = Self {
            object_name: RefCell::new(Value::String(settings.object_name.clone())),
            fields: RefCell::new(Value::String(settings.fields.clone())),
            criteria: RefCell::new(Value::String(settings.criteria.clone())),
            record_limit: RefCell::new(Value::String(settings.record_limit.clone())),
            context: settings.context.clone(),
            columns: RefCell::new(Vec::new()),
            records: RefCell::new(Vec::new()),
            selected_record_ids: RefCell::new(Vec::new()),
            queries: QueryTracker::default(),
            loading: Cell::new(false),
            events: EventLog::default(),
        };
        host.build_columns();
        host
    }

    fn slot(&self, name: &str) -> Option<&RefCell<Value>> {
        match name {
            OBJECT_NAME => Some(&self.object_name),
            FIELDS => Some(&self.fields),
            CRITERIA => Some(&self.criteria),
            RECORD_LIMIT => Some(&self.record_limit),
            _ => None,
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        let value = self.slot(name)?.borrow().clone();
        let text = render_value(&value);
        (!text.is_empty()).then_some(text)
    }

    fn build_columns(&self) {
        let columns = self
            .text(FIELDS)
            .map(|fields| {
                fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(|f| Column {
                        label: f.to_string(),
                        field_name: f.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        *self.columns.borrow_mut() = columns;
    }
}

impl StateHost for RecordListHost {
    fn type_name(&self) -> &str {
        "DeclarativeRecordList"
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.slot(name).map(|slot| slot.borrow().clone())
    }

    fn set_property(&self, name: &str, value: Value) {
        let Some(slot) = self.slot(name) else {
            log::warn!(target: LOG_TARGET, "DeclarativeRecordList: unknown property '{}'", name);
            return;
        };
        *slot.borrow_mut() = value;
        if name == FIELDS {
            self.build_columns();
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
// DeclarativeRecordList
// ---------------------------------------------------------------------------

pub struct DeclarativeRecordList {
    settings: RecordListSettings,
    host: Rc<RecordListHost>,
    participant: StateParticipant,
}

impl DeclarativeRecordList {
    pub fn new(bus: &StateBus, settings: RecordListSettings) -> Self {
        let host = Rc::new(RecordListHost::new(&settings));
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
            [OBJECT_NAME, FIELDS, CRITERIA, RECORD_LIMIT]
                .into_iter()
                .map(|name| DynamicPropertySpec::new(name).empty_if_not_resolvable()),
        ))
    }

    pub fn disconnect(&self) {
        self.participant.stop();
    }

    /// Current value of a query input.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.host.property(name)
    }

    pub fn columns(&self) -> Vec<Column> {
        self.host.columns.borrow().clone()
    }

    pub fn records(&self) -> Vec<Record> {
        self.host.records.borrow().clone()
    }

    pub fn selected_record_ids(&self) -> Vec<String> {
        self.host.selected_record_ids.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.host.loading.get()
    }

    pub fn query_identifier(&self) -> u64 {
        self.host.queries.current()
    }

    /// Whether an input changed since the last completed refresh.
    pub fn needs_refresh(&self) -> bool {
        self.host.queries.needs_refresh()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.host.events.snapshot()
    }

    /// Take the events dispatched so far.
    pub fn drain_events(&self) -> Vec<HostEvent> {
        self.host.events.drain()
    }

    /// The query the current inputs describe, `None` when incomplete.
    pub fn current_query(&self) -> Option<RecordQuery> {
        if !self.participant.is_initialized() {
            return None;
        }
        let object_name = self.host.text(OBJECT_NAME)?;
        let fields = self.host.text(FIELDS)?;
        let criteria = self.host.text(CRITERIA);
        if criteria.is_none() && !self.settings.show_all_when_criteria_missing {
            return None;
        }
        let record_limit = match &*self.host.record_limit.borrow() {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        Some(RecordQuery {
            object_name,
            fields,
            criteria,
            record_limit,
        })
    }

    /// Query the service with the current inputs.
    pub async fn refresh(&self, service: &dyn RecordQueryService) -> RefreshOutcome {
        let ticket = self.host.queries.current();
        let Some(query) = self.current_query() else {
            log::debug!(
                target: LOG_TARGET,
                "x queryRecords: {} (query {})",
                self.participant.identity(),
                ticket
            );
            self.host.records.borrow_mut().clear();
            self.host.queries.settle(ticket);
            return RefreshOutcome::Skipped;
        };

        log::debug!(
            target: LOG_TARGET,
            "-> queryRecords: {} {:?} (query {})",
            self.participant.identity(),
            query,
            ticket
        );
        self.host.loading.set(true);
        let result = service.get_records(&query).await;
        self.host.loading.set(false);

        match result {
            Ok(records) if self.host.queries.is_current(ticket) => {
                let count = records.len();
                *self.host.records.borrow_mut() = records;
                self.host.queries.settle(ticket);
                RefreshOutcome::Loaded(count)
            }
            Ok(_) => {
                log::debug!(
                    target: LOG_TARGET,
                    "{}: dropping stale response for query {}",
                    self.participant.identity(),
                    ticket
                );
                RefreshOutcome::Stale
            }
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "Record query error: {}: {}",
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

    /// Replace the row selection with `rows`, identified by their `Id` field.
    pub fn select_rows(&self, rows: &[Record]) {
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("Id"))
            .map(render_value)
            .filter(|id| !id.is_empty())
            .collect();
        *self.host.selected_record_ids.borrow_mut() = ids.clone();

        self.host.dispatch_event(HostEvent::custom(
            RECORD_SELECTION_CHANGE,
            json!({ "recordIds": ids }),
        ));

        if let Some(property) = &self.settings.selected_record_ids_property {
            let value = if ids.is_empty() {
                Value::Null
            } else {
                Value::String(format!("'{}'", ids.join("','")))
            };
            self.participant.publish(property.clone(), value);
        }
    }
}
