//! In-process fan-out of progress events.
//!
//! Delivery is best-effort and at-most-once with no replay: a subscriber
//! only sees events published after it subscribed. Events for one task
//! arrive in publish order because every subscriber has its own unbounded
//! FIFO channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;

use crate::progress::ProgressEvent;
use crate::task::TaskId;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Task(TaskId),
    /// Every task.
    All,
}

impl Topic {
    fn matches(&self, task_id: TaskId) -> bool {
        match self {
            Topic::Task(id) => *id == task_id,
            Topic::All => true,
        }
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }
}

/// Cheap to clone; all clones share one subscriber map.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching subscriber. Returns how many
    /// subscribers received it. Subscribers whose receiver is gone are pruned.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for (id, sub) in subscribers.iter() {
                if !sub.topic.matches(event.task_id) {
                    continue;
                }
                if sub.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.inner.remove(id);
        }
        delivered
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Subscriber { topic, tx });
        tracing::debug!(subscription = id, topic = ?topic, "Subscribed");
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Run `handler` for every event on `topic` in a background task until
    /// [`MessageBus::unsubscribe`] is called with the returned id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_with<F, Fut>(&self, topic: Topic, mut handler: F) -> u64
    where
        F: FnMut(ProgressEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe(topic);
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event).await;
            }
        });
        id
    }

    /// Remove one subscription. Its receiver drains what was already
    /// delivered and then ends.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    /// Remove every subscription on `Topic::Task(task_id)`.
    pub fn unsubscribe_task(&self, task_id: TaskId) -> usize {
        let mut subscribers = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|_, sub| sub.topic != Topic::Task(task_id));
        before - subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{EventStatus, ProgressUpdate};
    use chrono::Utc;

    fn event(task_id: TaskId, sequence: u64) -> ProgressEvent {
        ProgressEvent::from_update(
            task_id,
            sequence,
            0.0,
            ProgressUpdate::new(EventStatus::Executing, "test", format!("event {}", sequence)),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn task_topic_only_sees_its_task() {
        let bus = MessageBus::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let mut sub_a = bus.subscribe(Topic::Task(a));
        let mut all = bus.subscribe(Topic::All);

        assert_eq!(bus.publish(&event(a, 1)), 2);
        assert_eq!(bus.publish(&event(b, 1)), 1);

        assert_eq!(sub_a.try_recv().map(|e| e.task_id), Some(a));
        assert!(sub_a.try_recv().is_none());
        assert_eq!(all.try_recv().map(|e| e.task_id), Some(a));
        assert_eq!(all.try_recv().map(|e| e.task_id), Some(b));
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = MessageBus::new();
        let id = TaskId::new();
        let mut sub = bus.subscribe(Topic::Task(id));
        for seq in 1..=5 {
            bus.publish(&event(id, seq));
        }
        let mut seen = Vec::new();
        while let Some(e) = sub.try_recv() {
            seen.push(e.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn drop_and_unsubscribe_remove_subscribers() {
        let bus = MessageBus::new();
        let id = TaskId::new();
        let sub = bus.subscribe(Topic::Task(id));
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        let mut sub = bus.subscribe(Topic::Task(id));
        let _all = bus.subscribe(Topic::All);
        bus.publish(&event(id, 1));
        assert_eq!(bus.unsubscribe_task(id), 1);
        assert_eq!(bus.subscriber_count(), 1);

        // Already-delivered events drain, then the stream ends.
        assert_eq!(sub.recv().await.map(|e| e.sequence), Some(1));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn handler_subscription_receives_events() {
        let bus = MessageBus::new();
        let id = TaskId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub_id = bus.subscribe_with(Topic::All, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.sequence);
            }
        });

        bus.publish(&event(id, 7));
        assert_eq!(rx.recv().await, Some(7));
        assert!(bus.unsubscribe(sub_id));
    }
}
