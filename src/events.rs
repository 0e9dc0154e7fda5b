//! State-change notifications for list and detail views.

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::MailError;
use crate::ledger::{ActionId, ActionKind};
use crate::model::{ThreadId, ViewKey};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// Effective state of these threads may have changed
    ThreadsChanged(Vec<ThreadId>),
    /// Membership or order of an open view changed
    ViewChanged(ViewKey),
    LabelsChanged,
    /// A dispatched mutation was rolled back
    MutationFailed {
        action: ActionId,
        kind: ActionKind,
        threads: Vec<ThreadId>,
        error: MailError,
    },
}

/// Fan-out of [`StateEvent`]s; slow subscribers lag rather than block writers
pub struct EventBus {
    sender: broadcast::Sender<StateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StateEvent) {
        // No subscribers is fine; views subscribe lazily
        if self.sender.send(event).is_err() {
            trace!("events: no subscribers");
        }
    }

    pub fn threads_changed(&self, ids: &[ThreadId]) {
        if !ids.is_empty() {
            self.publish(StateEvent::ThreadsChanged(ids.to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.threads_changed(&["t1".to_string()]);
        bus.publish(StateEvent::LabelsChanged);

        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::ThreadsChanged(vec!["t1".to_string()])
        );
        assert_eq!(rx.recv().await.unwrap(), StateEvent::LabelsChanged);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(StateEvent::LabelsChanged);
        bus.threads_changed(&[]);
    }

    #[tokio::test]
    async fn test_empty_change_is_not_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.threads_changed(&[]);
        assert!(rx.try_recv().is_err());
    }
}
