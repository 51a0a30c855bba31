//! Declarative consumers built on [`StateParticipant`](crate::state::StateParticipant).
//!
//! Each consumer owns a participant and a host, wires the participant into
//! its own lifecycle (`connect` / `disconnect`) and talks to an external
//! collaborator through an async trait. Collaborator failures never reach
//! the participant: they are logged and surfaced to the host as an error
//! toast.

pub mod address_map;
pub mod button_group;
pub mod record_list;
pub mod transformation;

use std::cell::{Cell, RefCell};

use thiserror::Error;

use crate::state::HostEvent;

pub use address_map::{AddressMapSettings, DeclarativeAddressMap, Marker, MarkerLocation};
pub use button_group::{Button, ButtonVariant, DeclarativeButtonGroup};
pub use record_list::{
    Column, DeclarativeRecordList, InMemoryRecordService, Record, RecordListSettings, RecordQuery,
    RecordQueryService, RefreshOutcome,
};
pub use transformation::{
    DeclarativeStateTransformation, InMemoryRuleSource, TransformationRule,
    TransformationRuleSource,
};

pub(crate) const LOG_TARGET: &str = "state_sync::consumer";

/// Custom event dispatched when a query input changes and a refresh is due.
/// The detail is `{ "queryIdentifier": n }`.
pub const QUERY_CHANGE: &str = "querychange";

/// Failure reported by a query or rule-lookup collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The requested item does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// The service rejected or failed the request.
    #[error("{0}")]
    Failed(String),
}

/// Host events a consumer has emitted, oldest first.
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    events: RefCell<Vec<HostEvent>>,
}

impl EventLog {
    pub(crate) fn push(&self, event: HostEvent) {
        self.events.borrow_mut().push(event);
    }

    pub(crate) fn snapshot(&self) -> Vec<HostEvent> {
        self.events.borrow().clone()
    }

    pub(crate) fn drain(&self) -> Vec<HostEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

/// Generation counter for query inputs.
///
/// Every input write starts a new generation. A response is applied only if
/// it was requested for the current generation, and a generation is settled
/// once a refresh has run for it.
#[derive(Debug, Default)]
pub(crate) struct QueryTracker {
    current: Cell<u64>,
    settled: Cell<Option<u64>>,
}

impl QueryTracker {
    pub(crate) fn bump(&self) -> u64 {
        let next = self.current.get().wrapping_add(1);
        self.current.set(next);
        next
    }

    pub(crate) fn current(&self) -> u64 {
        self.current.get()
    }

    pub(crate) fn is_current(&self, ticket: u64) -> bool {
        self.current.get() == ticket
    }

    pub(crate) fn settle(&self, ticket: u64) {
        self.settled.set(Some(ticket));
    }

    pub(crate) fn needs_refresh(&self) -> bool {
        self.settled.get() != Some(self.current.get())
    }
}
