//! Notification fan-out
//!
//! Every subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: a queue that is closed or full gets its subscriber pruned.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ActivityState, StateChangeEvent};
use crate::server::Notification;

/// Default queue depth per subscriber
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A live subscription to state-change notifications
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Notification>,
}

impl Subscription {
    /// Subscriber identifier, used to unsubscribe
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next notification; `None` once pruned or unsubscribed
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Receive without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

/// Pub/sub hub for [`StateChangeEvent`]s
pub struct NotificationHub {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Notification>>>,
    capacity: usize,
}

impl NotificationHub {
    /// Create a hub with the default per-subscriber capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a hub with a custom per-subscriber capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Add a subscriber; its first notification is the given snapshot
    ///
    /// Callers must hold whatever lock serializes publishing while taking
    /// the snapshot, so that no transition falls between the two.
    pub async fn subscribe(&self, states: BTreeMap<String, ActivityState>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();

        // Fresh queue, cannot be full
        let _ = tx.try_send(Notification::InitialStates { states });

        self.subscribers.lock().await.insert(id, tx);
        debug!("Notification subscriber {} added", id);

        Subscription { id, rx }
    }

    /// Deliver an event to every subscriber
    ///
    /// Returns how many subscribers received it.
    pub async fn publish(&self, event: &StateChangeEvent) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;

        subscribers.retain(|id, tx| {
            match tx.try_send(Notification::AgentStateChange(event.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Notification subscriber {} is not keeping up, dropping it", id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Notification subscriber {} went away", id);
                    false
                }
            }
        });

        delivered
    }

    /// Remove a subscriber; returns `false` if it was already gone
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.lock().await.remove(&id).is_some()
    }

    /// Number of current subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(name: &str, state: ActivityState, previous: ActivityState) -> StateChangeEvent {
        StateChangeEvent::new(name, state, previous, Utc::now())
    }

    #[tokio::test]
    async fn test_subscribe_sends_snapshot_first() {
        let hub = NotificationHub::new();
        let mut states = BTreeMap::new();
        states.insert("dev".to_string(), ActivityState::Busy);

        let mut sub = hub.subscribe(states.clone()).await;
        assert_eq!(
            sub.recv().await,
            Some(Notification::InitialStates { states })
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let hub = NotificationHub::new();
        let mut a = hub.subscribe(BTreeMap::new()).await;
        let mut b = hub.subscribe(BTreeMap::new()).await;
        a.recv().await;
        b.recv().await;

        let ev = event("dev", ActivityState::Idle, ActivityState::Busy);
        assert_eq!(hub.publish(&ev).await, 2);

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(Notification::AgentStateChange(got)) => assert_eq!(got, ev),
                other => panic!("Expected state change, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let hub = NotificationHub::new();
        let dropped = hub.subscribe(BTreeMap::new()).await;
        let mut kept = hub.subscribe(BTreeMap::new()).await;
        kept.recv().await;
        drop(dropped);

        let delivered = hub
            .publish(&event("dev", ActivityState::Idle, ActivityState::Busy))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.subscriber_count().await, 1);
        assert!(matches!(
            kept.recv().await,
            Some(Notification::AgentStateChange(_))
        ));
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let hub = NotificationHub::with_capacity(2);
        // Never drained: snapshot + one event fill it
        let _stalled = hub.subscribe(BTreeMap::new()).await;
        let mut live = hub.subscribe(BTreeMap::new()).await;

        for _ in 0..3 {
            hub.publish(&event("dev", ActivityState::Busy, ActivityState::Idle))
                .await;
            while live.try_recv().is_some() {}
        }

        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(BTreeMap::new()).await;
        assert!(hub.unsubscribe(sub.id()).await);
        assert!(!hub.unsubscribe(sub.id()).await);
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
