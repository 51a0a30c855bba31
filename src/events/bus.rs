//! In-process state bus.
//!
//! The bus is a direct-dispatch registry: [`StateBus::publish`] calls every
//! handler subscribed to the message's channel, in subscription order, before
//! it returns. Handlers may publish again from inside their callback. Each
//! dispatch iterates a snapshot of the handler list, so nested publishes and
//! (un)subscriptions never disturb an ongoing fan-out:
//!
//! - a handler removed mid-dispatch is skipped for the rest of that dispatch;
//! - a handler added mid-dispatch is first called on the next publish.
//!
//! The bus is single-threaded (`Rc`-based) and cheap to clone; clones share
//! the same subscriber registry and identity allocator.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::messages::BusMessage;
use crate::config::StateSyncConfig;

const LOG_TARGET: &str = "state_sync::bus";

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// A type-erased handler. Receives the message as `&dyn Any` and downcasts
/// it to the channel's message type.
type ErasedHandler = Rc<dyn Fn(&dyn Any)>;

/// Identifier of a subscription, used to unsubscribe.
#[derive(Clone)]
pub struct HandlerId {
    /// Human-readable name.
    pub name: String,
    /// Unique numeric id within the bus (monotonically increasing).
    id: u64,
}

impl HandlerId {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({}:{})", self.id, self.name)
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for HandlerId {}

impl std::hash::Hash for HandlerId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: HandlerId,
    handler: ErasedHandler,
    /// Cleared on unsubscribe so in-flight snapshots skip the handler.
    active: Rc<Cell<bool>>,
}

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Hands out participant ids.
///
/// Ids are strictly increasing and never reused for the allocator's
/// lifetime. [`reset`](Self::reset) exists for independent test runs only.
#[derive(Debug)]
pub struct IdAllocator {
    first: u64,
    /// `None` once `u64::MAX` has been handed out.
    next: Cell<Option<u64>>,
}

impl IdAllocator {
    pub fn new(first: u64) -> Self {
        Self {
            first,
            next: Cell::new(Some(first)),
        }
    }

    /// Allocate the next id, or `None` when the id space is exhausted.
    pub fn try_next_id(&self) -> Option<u64> {
        let id = self.next.get()?;
        self.next.set(id.checked_add(1));
        Some(id)
    }

    /// Allocate the next id.
    ///
    /// Past exhaustion `u64::MAX` is returned again and an error is logged.
    pub fn next_id(&self) -> u64 {
        self.try_next_id().unwrap_or_else(|| {
            log::error!(target: LOG_TARGET, "participant id space exhausted");
            u64::MAX
        })
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> Option<u64> {
        self.next.get()
    }

    /// Restart allocation from the first id.
    pub fn reset(&self) {
        self.next.set(Some(self.first));
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

// ---------------------------------------------------------------------------
// StateBus
// ---------------------------------------------------------------------------

struct BusInner {
    /// Handlers keyed by message `TypeId`, in subscription order.
    handlers: RefCell<HashMap<TypeId, Vec<HandlerEntry>>>,
    next_handler_id: Cell<u64>,
    ids: IdAllocator,
    config: StateSyncConfig,
}

/// Broadcast channel shared by all participants of one page.
#[derive(Clone)]
pub struct StateBus {
    inner: Rc<BusInner>,
}

impl StateBus {
    pub fn new() -> Self {
        Self::with_config(StateSyncConfig::default())
    }

    pub fn with_config(config: StateSyncConfig) -> Self {
        Self {
            inner: Rc::new(BusInner {
                handlers: RefCell::new(HashMap::new()),
                next_handler_id: Cell::new(1),
                ids: IdAllocator::new(config.first_participant_id),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StateSyncConfig {
        &self.inner.config
    }

    /// The identity allocator shared by every participant on this bus.
    pub fn ids(&self) -> &IdAllocator {
        &self.inner.ids
    }

    /// Allocate a participant id.
    pub fn allocate_id(&self) -> u64 {
        self.inner.ids.next_id()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Subscribe `handler` to the channel of message type `M`.
    pub fn on<M: BusMessage>(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&M) + 'static,
    ) -> HandlerId {
        let id = HandlerId {
            name: name.into(),
            id: self.inner.next_handler_id.get(),
        };
        self.inner.next_handler_id.set(id.id.saturating_add(1));

        let erased: ErasedHandler = Rc::new(move |message: &dyn Any| {
            if let Some(message) = message.downcast_ref::<M>() {
                handler(message);
            }
        });
        let entry = HandlerEntry {
            id: id.clone(),
            handler: erased,
            active: Rc::new(Cell::new(true)),
        };

        self.inner
            .handlers
            .borrow_mut()
            .entry(TypeId::of::<M>())
            .or_default()
            .push(entry);
        log::trace!(target: LOG_TARGET, "subscribed {:?} to {}", id, M::CHANNEL);
        id
    }

    /// Unsubscribe a handler from the channel of message type `M`.
    ///
    /// Returns `false` if the handler was not subscribed.
    pub fn off<M: BusMessage>(&self, handler_id: &HandlerId) -> bool {
        let type_id = TypeId::of::<M>();
        let mut map = self.inner.handlers.borrow_mut();
        let Some(entries) = map.get_mut(&type_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| {
            if e.id == *handler_id {
                e.active.set(false);
                false
            } else {
                true
            }
        });
        let removed = entries.len() != before;
        if entries.is_empty() {
            map.remove(&type_id);
        }
        if removed {
            log::trace!(target: LOG_TARGET, "unsubscribed {:?} from {}", handler_id, M::CHANNEL);
        }
        removed
    }

    /// Number of handlers currently subscribed to the channel of `M`.
    pub fn subscriber_count<M: BusMessage>(&self) -> usize {
        self.inner
            .handlers
            .borrow()
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    /// Deliver `message` to every subscriber of its channel.
    ///
    /// Returns the number of handlers that were called.
    pub fn publish<M: BusMessage>(&self, message: &M) -> usize {
        let entries: Vec<HandlerEntry> = {
            let map = self.inner.handlers.borrow();
            match map.get(&TypeId::of::<M>()) {
                Some(v) => v.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for entry in &entries {
            if !entry.active.get() {
                continue;
            }
            delivered += 1;
            self.dispatch(entry, message as &dyn Any, M::CHANNEL);
        }
        delivered
    }

    fn dispatch(&self, entry: &HandlerEntry, message: &dyn Any, channel: &str) {
        if !self.inner.config.catch_handler_panics {
            (entry.handler)(message);
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(message)));
        if let Err(payload) = result {
            log::error!(
                target: LOG_TARGET,
                "[StateBus] Handler {:?} panicked on {}: {}",
                entry.id,
                channel,
                panic_message(payload.as_ref())
            );
        }
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.inner.handlers.borrow();
        f.debug_struct("StateBus")
            .field("channels", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .field("next_id", &self.inner.ids.peek())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
