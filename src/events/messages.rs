//! Messages carried by the state bus.
//!
//! Two logical channels exist: `state.update` carries a single property
//! change together with its publisher, `state.initRequest` asks every other
//! live participant to re-broadcast what it has published so far.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message type that can travel over a [`StateBus`](super::StateBus).
///
/// Each message type is its own channel; subscribers register per type.
pub trait BusMessage: Any + Clone + fmt::Debug {
    /// Logical channel name, used in logs.
    const CHANNEL: &'static str;
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of a participant as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantRef {
    /// Display name (defaults to the participant's type name).
    pub name: String,
    /// Unique, strictly increasing participant id.
    pub id: u64,
}

impl ParticipantRef {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:id-{}", self.name, self.id)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A named property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    pub value: Value,
}

impl PropertyChange {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Broadcast whenever a participant publishes a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateMessage {
    pub property: PropertyChange,
    pub publisher: ParticipantRef,
}

impl BusMessage for StateUpdateMessage {
    const CHANNEL: &'static str = "state.update";
}

/// Broadcast once by a participant when it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInitRequestMessage {
    pub requester: ParticipantRef,
}

impl BusMessage for StateInitRequestMessage {
    const CHANNEL: &'static str = "state.initRequest";
}
