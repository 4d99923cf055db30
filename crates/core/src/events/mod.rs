//! Event dispatch
//!
//! Handlers publish what they observe to sinks registered by collaborators.
//! Each event kind has its own [`EventDispatcher`]; [`Dispatchers`] holds one
//! of each and [`DispatchedEvent`] picks the right one from the payload type.

pub mod dispatcher;
pub mod types;

use std::sync::Arc;

pub use dispatcher::{EventDispatcher, EventSink};
pub use types::{CreateWeaponNodesEvent, SetEquipSlotEvent};

/// Trait for payload types that have a dispatcher in [`Dispatchers`]
pub trait DispatchedEvent: Sized + 'static {
    /// The event name used in diagnostics
    const NAME: &'static str;

    /// Select this event's dispatcher
    fn dispatcher(dispatchers: &Dispatchers) -> &EventDispatcher<Self>;
}

/// One dispatcher per event kind.
#[derive(Default)]
pub struct Dispatchers {
    create_weapon_nodes: EventDispatcher<CreateWeaponNodesEvent>,
    set_equip_slot: EventDispatcher<SetEquipSlotEvent>,
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for events of type `E`.
    ///
    /// Returns false when the same sink was already registered.
    pub fn register<E: DispatchedEvent>(&self, sink: Arc<dyn EventSink<E>>) -> bool {
        E::dispatcher(self).add_sink(sink)
    }

    /// Deliver `event` to every sink registered for `E`.
    pub fn publish<E: DispatchedEvent>(&self, event: &E) {
        E::dispatcher(self).send_event(event);
    }

    pub fn get<E: DispatchedEvent>(&self) -> &EventDispatcher<E> {
        E::dispatcher(self)
    }
}

impl DispatchedEvent for CreateWeaponNodesEvent {
    const NAME: &'static str = "CreateWeaponNodes";

    fn dispatcher(dispatchers: &Dispatchers) -> &EventDispatcher<Self> {
        &dispatchers.create_weapon_nodes
    }
}

impl DispatchedEvent for SetEquipSlotEvent {
    const NAME: &'static str = "SetEquipSlot";

    fn dispatcher(dispatchers: &Dispatchers) -> &EventDispatcher<Self> {
        &dispatchers.set_equip_slot
    }
}
