//! Event bus abstraction for decoupled event emission.
//!
//! The core emits through a trait so it can be unit-tested without any
//! transport and embedded in different hosts.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::SessionEvent;

/// Trait for delivering session events to subscribers.
pub trait EventBus: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Shared event bus reference.
pub type EventBusRef = Arc<dyn EventBus>;

/// In-memory event bus for testing. Captures every emitted event in order.
#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<SessionEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for which `predicate` holds, in emission order.
    pub fn events_where<F>(&self, predicate: F) -> Vec<SessionEvent>
    where
        F: Fn(&SessionEvent) -> bool,
    {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// No-op event bus that discards all events.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: SessionEvent) {}
}

/// Fan-out bus over a tokio broadcast channel. Slow subscribers lose the
/// oldest events rather than blocking the runtime.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: SessionEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentState, UserState};

    #[test]
    fn in_memory_bus_captures_in_order() {
        let bus = InMemoryEventBus::new();
        bus.emit(SessionEvent::AgentStateChanged {
            state: AgentState::Thinking,
        });
        bus.emit(SessionEvent::UserStateChanged {
            state: UserState::Listening,
        });

        assert_eq!(bus.len(), 2);
        let states = bus.events_where(|e| matches!(e, SessionEvent::AgentStateChanged { .. }));
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn in_memory_bus_clear() {
        let bus = InMemoryEventBus::new();
        bus.emit(SessionEvent::UserStateChanged {
            state: UserState::Away,
        });
        assert!(!bus.is_empty());
        bus.clear();
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn broadcast_bus_fans_out() {
        let bus = BroadcastEventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::AgentStateChanged {
            state: AgentState::Listening,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            SessionEvent::AgentStateChanged {
                state: AgentState::Listening
            }
        ));
    }

    #[test]
    fn null_bus_discards() {
        NullEventBus.emit(SessionEvent::UserStateChanged {
            state: UserState::Speaking,
        });
    }
}
