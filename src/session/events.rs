//! Event fan-out to session observers.
//!
//! Unbounded channels keep publishing non-blocking for the machine; a slow
//! observer accumulates backlog in its own channel and an absent one is
//! pruned on the next publish.

use crate::domain::models::SessionEvent;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn attach(&mut self, sender: mpsc::UnboundedSender<SessionEvent>) {
        self.subscribers.push(sender);
    }

    pub fn publish(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_all_live_subscribers() {
        let mut bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        bus.publish(SessionEvent::ConnectionChanged(true));
        bus.publish(SessionEvent::ConnectionChanged(false));

        assert!(matches!(
            first.recv().await,
            Some(SessionEvent::ConnectionChanged(true))
        ));
        assert!(matches!(
            first.recv().await,
            Some(SessionEvent::ConnectionChanged(false))
        ));
    }
}
