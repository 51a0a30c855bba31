//! The state bus and the messages it carries.
//!
//! The bus is an in-process publish/subscribe hub. Each message type is its
//! own channel: `state.update` carries property changes, `state.initRequest`
//! asks live participants to re-broadcast their values.

// ---------------------------------------------------------------------------
// Core infrastructure modules
// ---------------------------------------------------------------------------

/// Typed, single-threaded publish/subscribe hub and participant id allocator.
pub mod bus;

/// Wire types for the two state channels.
pub mod messages;

// ---------------------------------------------------------------------------
// Convenience re-exports
// ---------------------------------------------------------------------------

pub use bus::{HandlerId, IdAllocator, StateBus};
pub use messages::{
    BusMessage, ParticipantRef, PropertyChange, StateInitRequestMessage, StateUpdateMessage,
};
