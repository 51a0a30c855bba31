//! Participant-side state handling.
//!
//! A [`StateParticipant`] is attached to a [`StateHost`]. On start it turns
//! every configured property whose value holds merge fields into a dynamic
//! property, keeps a view of the values other participants have published
//! and rewrites the host's properties whenever a monitored field changes.

pub mod dynamic_property;
pub mod host;
pub mod participant;

pub use dynamic_property::{
    resolve_template, DynamicPropertyDescriptor, DynamicPropertySpec, DynamicPropertyUpdater,
    Resolution, StateMap, UpdateOutcome, UpdateReason,
};
pub use host::{HostAccessors, HostContext, HostEvent, MemoryHost, StateHost, ToastVariant};
pub use participant::{
    ParticipantError, ParticipantStatus, StartOptions, StateParticipant, StateUpdateCallback,
};
