//! Events emitted by a [`Transport`](crate::Transport) and the bus that delivers them.
//!
//! Subscribers register with [`EventBus::on`] and receive every subsequent
//! event on their own unbounded channel, so a slow or dropped subscriber can
//! never hold up delivery to the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error_kind::ErrorKind;
use crate::lock;
use crate::protocol::{GuestMessage, HostMessage, PeerId};

/// Connection status of this device (not of individual guests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    /// Returns `true` if moving from `self` to `next` is allowed.
    ///
    /// `Reconnecting` is only reachable from a prior `Connected` state.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        next != Self::Reconnecting || matches!(self, Self::Connected | Self::Reconnecting)
    }
}

/// Everything a transport reports to the layers above it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Host registration or guest join completed.
    Open { room_code: String },
    /// (host) A guest link was established.
    GuestConnected { peer_id: PeerId },
    /// (host) A guest link ended, for any reason.
    GuestDisconnected { peer_id: PeerId },
    /// (host) A validated intent arrived from a guest.
    GuestMessage {
        peer_id: PeerId,
        message: GuestMessage,
    },
    /// (guest) A validated message arrived from the host.
    HostMessage(HostMessage),
    /// The link failed or was lost.
    ConnectionError { kind: ErrorKind, message: String },
    /// This device's connection status changed.
    StatusChange(ConnectionStatus),
    /// (host) A guest stopped answering heartbeats and was closed.
    GuestStale { peer_id: PeerId },
    /// (guest) The host stopped answering heartbeats.
    HostStale,
    /// A setup attempt failed and another will follow after `delay`.
    Retry {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
}

/// Handle returned by [`EventBus::on`].
pub type SubscriptionId = u64;

/// A live event subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Fan-out of [`TransportEvent`]s to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<TransportEvent>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn on(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push((id, tx));
        Subscription { id, events: rx }
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Deliver an event to every subscriber.
    ///
    /// Subscribers whose receiver has been dropped are pruned.
    pub fn emit(&self, event: TransportEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|(id, tx)| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(subscription = id, "pruning closed event subscriber");
            }
            delivered
        });
    }

    /// Drop every subscriber. Their receivers will yield `None`.
    pub fn clear(&self) {
        lock(&self.subscribers).clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn reconnecting_requires_prior_connection() {
        use ConnectionStatus::*;
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Reconnecting));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Error.can_transition_to(Reconnecting));
        assert!(Error.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut a = bus.on();
        let mut b = bus.on();
        bus.emit(TransportEvent::HostStale);
        assert_eq!(a.events.recv().await, Some(TransportEvent::HostStale));
        assert_eq!(b.events.recv().await, Some(TransportEvent::HostStale));
    }

    #[test]
    fn emit_wakes_a_waiting_subscriber() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let bus = EventBus::new();
        let mut sub = bus.on();
        let mut recv = task::spawn(sub.events.recv());
        assert_pending!(recv.poll());

        bus.emit(TransportEvent::HostStale);
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(TransportEvent::HostStale));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let dropped = bus.on();
        let mut kept = bus.on();
        drop(dropped);

        bus.emit(TransportEvent::StatusChange(ConnectionStatus::Connected));
        assert_eq!(
            kept.events.recv().await,
            Some(TransportEvent::StatusChange(ConnectionStatus::Connected))
        );
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn off_stops_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.on();
        assert!(bus.off(sub.id));
        assert!(!bus.off(sub.id));
        bus.emit(TransportEvent::HostStale);
        assert_eq!(sub.events.recv().await, None);
    }
}
