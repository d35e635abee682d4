use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Status,
    Pull,
    Error,
    Warn,
    Command,
    Log,
    /// Consumed in-process only; never forwarded to clients.
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub category: EventCategory,
    pub message: String,
    pub timestamp: i64,
}

/// Per-instance fan-out of live events. Each subscriber gets its own
/// unbounded channel: delivery is FIFO per subscriber and a closed or slow
/// receiver never affects the others. There is no replay buffer; a
/// subscriber only sees events emitted after it subscribed.
#[derive(Default)]
pub struct LiveEventBus {
    subscribers: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<LiveEvent>>>>,
    next_id: AtomicU64,
}

impl LiveEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (LiveSubscription, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, tx);
        }
        (
            LiveSubscription {
                id,
                subscribers: Arc::downgrade(&self.subscribers),
            },
            rx,
        )
    }

    pub fn emit(&self, category: EventCategory, message: impl Into<String>) {
        let event = LiveEvent {
            category,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn clear(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Owns nothing of the instance beyond the ability to unsubscribe; dropping
/// it detaches the listener.
pub struct LiveSubscription {
    id: u64,
    subscribers: Weak<Mutex<HashMap<u64, mpsc::UnboundedSender<LiveEvent>>>>,
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(subs) = self.subscribers.upgrade()
            && let Ok(mut subs) = subs.lock()
        {
            subs.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = LiveEventBus::new();
        let (_sub, mut rx) = bus.subscribe();

        bus.emit(EventCategory::Status, "first");
        bus.emit(EventCategory::Log, "second");
        bus.emit(EventCategory::Error, "third");

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert_eq!(rx.recv().await.unwrap().message, "second");
        let third = rx.recv().await.unwrap();
        assert_eq!(third.message, "third");
        assert_eq!(third.category, EventCategory::Error);
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus = LiveEventBus::new();
        bus.emit(EventCategory::Status, "before");

        let (_sub, mut rx) = bus.subscribe();
        bus.emit(EventCategory::Status, "after");

        assert_eq!(rx.recv().await.unwrap().message, "after");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_the_rest() {
        let bus = LiveEventBus::new();
        let (sub_a, rx_a) = bus.subscribe();
        let (_sub_b, mut rx_b) = bus.subscribe();

        drop(rx_a);
        bus.emit(EventCategory::Status, "still delivered");

        assert_eq!(rx_b.recv().await.unwrap().message, "still delivered");
        drop(sub_a);
    }

    #[tokio::test]
    async fn dropping_the_subscription_detaches() {
        let bus = LiveEventBus::new();
        let (sub, mut rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(EventCategory::Status, "gone");
        assert!(rx.recv().await.is_none());
    }
}
