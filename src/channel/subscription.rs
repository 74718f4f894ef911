//! Topic subscriptions shared by every transport.
//!
//! The registry maps topics to unbounded senders. Dispatch fans a message out
//! to every subscription on its topic; removing a subscription takes effect
//! before `remove` returns, so a message dispatched afterwards can never
//! reach it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::InboundMessage;

/// Identifier of one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Senders = HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<InboundMessage>)>>;

/// Topic → subscribers table.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: Mutex<Senders>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topics(&self) -> MutexGuard<'_, Senders> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscription for `topic`.
    pub fn register(self: &Arc<Self>, topic: &str) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics()
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        log::trace!("[Subscriptions] Registered {:?} on {}", id, topic);
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Deregister a subscription. Unknown ids are ignored.
    pub fn remove(&self, id: SubscriptionId) {
        let mut topics = self.topics();
        topics.retain(|_, subscribers| {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            !subscribers.is_empty()
        });
    }

    /// Deliver `message` to every subscription on its topic.
    ///
    /// Returns the number of subscriptions that received it.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(&message.topic) else {
            log::trace!(
                "[Subscriptions] No subscriber for {} ({})",
                message.topic,
                message.event
            );
            return 0;
        };
        subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        let delivered = subscribers.len();
        if delivered == 0 {
            topics.remove(&message.topic);
        }
        delivered
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics().get(topic).map_or(0, Vec::len)
    }
}

/// Receiving end of a topic subscription.
///
/// Dropping the subscription deregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    /// Identifier of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }

    /// Deregister now. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
