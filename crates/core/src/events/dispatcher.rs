//! Typed event dispatcher
//!
//! Sinks are notified synchronously, in registration order, on the thread
//! that publishes. A sink that panics is reported and skipped; the rest
//! still receive the event.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

/// Receiver of events of type `E`
pub trait EventSink<E>: Send + Sync {
    fn receive(&self, event: &E);
}

/// Ordered list of sinks for one event kind.
pub struct EventDispatcher<E> {
    sinks: RwLock<Vec<Arc<dyn EventSink<E>>>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventDispatcher<E> {
    pub const fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Append a sink. Adding a sink that is already registered does nothing
    /// and returns false.
    pub fn add_sink(&self, sink: Arc<dyn EventSink<E>>) -> bool {
        let mut sinks = self.sinks.write();
        if sinks.iter().any(|existing| same_sink(existing, &sink)) {
            return false;
        }
        sinks.push(sink);
        true
    }

    /// Deliver `event` to every sink in registration order.
    pub fn send_event(&self, event: &E) {
        let sinks = self.sinks.read();
        for (index, sink) in sinks.iter().enumerate() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.receive(event))) {
                tracing::error!(
                    "Event sink #{} panicked: {}",
                    index,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}

/// Compare sinks by the object they point to, ignoring vtable identity
fn same_sink<E>(a: &Arc<dyn EventSink<E>>, b: &Arc<dyn EventSink<E>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
