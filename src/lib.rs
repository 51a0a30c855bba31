//! # state-sync
//!
//! Distributed application state for independent UI elements.
//!
//! Elements on the same page share named values over an in-process
//! [`StateBus`]. Each element owns a [`StateParticipant`] that publishes its
//! own values and rewrites the element's properties whose templates contain
//! `{merge fields}` whenever another element publishes a value for one of
//! those fields. Elements that start late ask everyone to re-broadcast, so
//! they converge to the same state as elements that were present from the
//! beginning.
//!
//! ```
//! use std::rc::Rc;
//! use serde_json::json;
//! use state_sync::{DynamicPropertySpec, MemoryHost, StartOptions, StateBus, StateParticipant};
//!
//! let bus = StateBus::new();
//! let host = Rc::new(MemoryHost::new("ContactList").with_property("criteria", "AccountId = '{accountId}'"));
//! let list = StateParticipant::new(&bus, host.clone());
//! list.start(StartOptions::new().dynamic_property(DynamicPropertySpec::new("criteria"))).unwrap();
//!
//! let picker = StateParticipant::new(&bus, Rc::new(MemoryHost::new("AccountPicker")));
//! picker.start(StartOptions::new()).unwrap();
//! picker.publish("accountId", "001A");
//!
//! assert_eq!(host.get("criteria"), Some(json!("AccountId = '001A'")));
//! ```

pub mod config;
pub mod consumers;
pub mod events;
pub mod state;
pub mod utilities;

pub use config::{ConfigError, StateSyncConfig};
pub use consumers::{
    DeclarativeAddressMap, DeclarativeButtonGroup, DeclarativeRecordList,
    DeclarativeStateTransformation, ServiceError,
};
pub use events::{ParticipantRef, PropertyChange, StateBus, StateInitRequestMessage, StateUpdateMessage};
pub use state::{
    DynamicPropertySpec, HostAccessors, HostContext, HostEvent, MemoryHost, ParticipantError,
    StartOptions, StateHost, StateParticipant,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
