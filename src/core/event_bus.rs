//! Typed notifications from the cache control thread to UI collaborators.
//!
//! Two ways to listen:
//! - `subscribe::<E, _>()` registers a callback run on the control thread as
//!   soon as an `E` is emitted (badge updates, give-up dialogs)
//! - `poll()` hands over everything emitted since the last poll, oldest first,
//!   for UI loops that redraw once per frame
//!
//! The cache never emits while holding its state lock, so callbacks may call
//! back into the cache handle.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Events kept for `poll()`; the oldest are dropped beyond this
const MAX_QUEUE_SIZE: usize = 1000;

/// Anything the cache can emit
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Listener = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Emitted event as stored for `poll()`
pub type BoxedEvent = Box<dyn Event>;

#[derive(Default)]
struct Pending {
    events: VecDeque<BoxedEvent>,
    dropped: u64,
}

/// Cloneable handle; clones share listeners and the poll queue
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<(TypeId, Listener)>>>,
    pending: Arc<Mutex<Pending>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().map(|l| l.len()).unwrap_or(0))
            .field("pending", &self.pending.lock().map(|p| p.events.len()).unwrap_or(0))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `listener` for every emitted `E`.
    ///
    /// ```ignore
    /// cache.events().subscribe::<ItemCacheChanged, _>(|e| {
    ///     thumbnails.set_badge(&e.path, e.cached);
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, listener: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let erased: Listener = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                listener(event);
            }
        });
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((TypeId::of::<E>(), erased));
    }

    /// Notify listeners of `E`, then keep the event for `poll()`.
    pub fn emit<E: Event>(&self, event: E) {
        // Listeners run outside the lock so they may subscribe in turn
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(id, _)| *id == TypeId::of::<E>())
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in matching {
            listener(&event);
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.events.len() >= MAX_QUEUE_SIZE {
            pending.events.pop_front();
            if pending.dropped == 0 {
                warn!("Nobody polls cache events, dropping the oldest beyond {}", MAX_QUEUE_SIZE);
            }
            pending.dropped += 1;
        }
        pending.events.push_back(Box::new(event));
    }

    /// Events emitted since the last poll, oldest first
    pub fn poll(&self) -> Vec<BoxedEvent> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.dropped = 0;
        pending.events.drain(..).collect()
    }
}

/// Downcast a polled event to a concrete type.
///
/// Derefs to `dyn Event` first; calling `as_any()` on the `Box` itself would
/// hit the blanket impl for `Box<dyn Event>` and never match.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}
