//! Synchronous event dispatch for call lifecycles.
//!
//! This is a plain callback registry: handlers subscribe to an event kind,
//! and [`EventBus::emit`] invokes every matching handler immediately, on the
//! emitting thread, in subscription order. There is no queueing, no async
//! machinery and no delivery guarantee beyond "the handlers that were
//! subscribed when `emit` started all run before `emit` returns".
//!
//! The handler list is snapshotted before dispatch, so a handler may freely
//! subscribe, unsubscribe or emit further events without deadlocking the
//! bus; handlers added during an emission are first invoked on the next one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use smallvec::SmallVec;

/// An event family that can be routed through an [`EventBus`].
///
/// `Kind` is the subscription key: a cheap, copyable discriminant that
/// identifies which variant of the event payload a handler cares about.
pub trait BusEvent {
    /// Discriminant used to route an event to its subscribers.
    type Kind: Copy + Eq + Hash + std::fmt::Debug;

    /// Returns the routing discriminant for this event instance.
    fn kind(&self) -> Self::Kind;
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct HandlerEntry<E> {
    id: SubscriberId,
    handler: Handler<E>,
}

// Most kinds have a handful of subscribers (the built-in state cells plus
// one or two addons), so the entries are kept inline.
type HandlerList<E> = SmallVec<[HandlerEntry<E>; 4]>;

/// Ordered, synchronous fan-out dispatcher.
///
/// # Example
///
/// ```ignore
/// let bus: EventBus<CallEvent> = EventBus::new();
/// let id = bus.on(CallEventKind::Fulfill, |event| observe(event));
/// bus.emit(&CallEvent::Fulfill { .. });
/// bus.off(CallEventKind::Fulfill, id);
/// ```
pub struct EventBus<E: BusEvent> {
    handlers: Mutex<HashMap<E::Kind, HandlerList<E>>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribes `handler` to events of `kind`.
    ///
    /// Handlers for one kind run in subscription order. The returned id is
    /// only meaningful together with the same `kind`.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> SubscriberId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.entry(kind).or_default().push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a subscription; returns whether it was still registered.
    pub fn off(&self, kind: E::Kind, id: SubscriberId) -> bool {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        before != list.len()
    }

    /// Invokes every handler subscribed to `event.kind()`, in order.
    pub fn emit(&self, event: &E) {
        let snapshot: HandlerList<E> = {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match handlers.get(&event.kind()) {
                Some(list) => list
                    .iter()
                    .map(|entry| HandlerEntry {
                        id: entry.id,
                        handler: Arc::clone(&entry.handler),
                    })
                    .collect(),
                None => return,
            }
        };

        for entry in &snapshot {
            (entry.handler)(event);
        }
    }

    /// Number of handlers currently subscribed to `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, SmallVec::len)
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("kinds", &handlers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        A,
        B,
    }

    #[derive(Debug)]
    struct TestEvent(Kind);

    impl BusEvent for TestEvent {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn emit_reaches_only_matching_kind() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        bus.on(Kind::A, move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&TestEvent(Kind::A));
        bus.emit(&TestEvent(Kind::B));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(Kind::A, move |_| {
                order.lock().unwrap_or_else(PoisonError::into_inner).push(tag);
            });
        }

        bus.emit(&TestEvent(Kind::A));
        let seen = order.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*seen, vec!["first", "second", "third"]);
    }

    #[test]
    fn off_removes_exactly_one_subscription() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_keep = Arc::clone(&hits);
        bus.on(Kind::A, move |_| {
            hits_keep.fetch_add(1, Ordering::SeqCst);
        });
        let hits_drop = Arc::clone(&hits);
        let removable = bus.on(Kind::A, move |_| {
            hits_drop.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off(Kind::A, removable));
        assert!(!bus.off(Kind::A, removable));

        bus.emit(&TestEvent(Kind::A));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus: Arc<EventBus<TestEvent>> = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let bus_inner = Arc::clone(&bus);
        let hits_inner = Arc::clone(&hits);
        bus.on(Kind::A, move |_| {
            let hits_late = Arc::clone(&hits_inner);
            bus_inner.on(Kind::A, move |_| {
                hits_late.fetch_add(1, Ordering::SeqCst);
            });
        });

        // The late handler registers during the first emission and only runs
        // on the second one.
        bus.emit(&TestEvent(Kind::A));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.emit(&TestEvent(Kind::A));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
