//! Typed publish/subscribe surface for one capability client instance.
//!
//! Listeners are scoped to the client that created them; nothing routes
//! through process-wide state. Closed subscribers are pruned on emit.

use tokio::sync::mpsc;

use super::{EndpointRole, EndpointState};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionState {
        role: EndpointRole,
        state: EndpointState,
    },
    ToolsUpdated {
        total: usize,
    },
    Error {
        role: EndpointRole,
        message: String,
    },
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<ClientEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: ClientEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fan_out_to_all_subscribers() {
        let mut bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(ClientEvent::ToolsUpdated { total: 3 });

        assert_eq!(
            first.try_recv().expect("first"),
            ClientEvent::ToolsUpdated { total: 3 }
        );
        assert_eq!(
            second.try_recv().expect("second"),
            ClientEvent::ToolsUpdated { total: 3 }
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned_on_emit() {
        let mut bus = EventBus::default();
        let receiver = bus.subscribe();
        drop(receiver);

        bus.emit(ClientEvent::ToolsUpdated { total: 0 });
        assert!(bus.subscribers.is_empty());
    }

    #[test]
    fn clear_detaches_all_listeners() {
        let mut bus = EventBus::default();
        let mut receiver = bus.subscribe();
        bus.clear();
        bus.emit(ClientEvent::ToolsUpdated { total: 1 });
        assert!(receiver.try_recv().is_err());
    }
}
