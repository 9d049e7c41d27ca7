//! In-process broadcast of detected events to live subscribers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Events buffered per subscriber before drops kick in.
const SUBSCRIBER_BUFFER: usize = 1000;

/// A normalized detection, usually carrying its database identifier.
///
/// `event_id` is `None` when the persistence write failed; live delivery
/// still happens.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedEvent {
    pub event_id: Option<i32>,
    pub event_timestamp: DateTime<Utc>,
    pub event_code: String,
    pub event_description: String,
    pub event_video_url: String,
    pub event_detection_explanation_by_ai: String,
}

/// Non-blocking fan-out with a bounded buffer per subscriber.
///
/// A saturated subscriber loses events; it never stalls the publisher.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<DetectedEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live subscriber. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_buffer(SUBSCRIBER_BUFFER)
    }

    fn subscribe_with_buffer(&self, buffer: usize) -> EventSubscription {
        let (tx, rx) = mpsc::channel(buffer);
        self.subscribers.lock().unwrap().push(tx);
        EventSubscription { rx }
    }

    /// Deliver `event` to every live subscriber without ever blocking.
    pub fn publish(&self, event: &DetectedEvent) {
        // Snapshot the sender list so unsubscribes during delivery are safe.
        let snapshot: Vec<_> = self.subscribers.lock().unwrap().clone();
        if snapshot.is_empty() {
            return;
        }

        let mut saw_closed = false;
        for tx in &snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(code = %event.event_code, "subscriber buffer full, dropping event");
                }
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.subscribers.lock().unwrap().retain(|tx| !tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Receiving half of one bus subscription.
pub struct EventSubscription {
    rx: mpsc::Receiver<DetectedEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn next(&mut self) -> Option<DetectedEvent> {
        self.rx.recv().await
    }

    /// Stop accepting new events; already-buffered ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(code: &str) -> DetectedEvent {
        DetectedEvent {
            event_id: Some(1),
            event_timestamp: Utc::now(),
            event_code: code.to_string(),
            event_description: "test".to_string(),
            event_video_url: String::new(),
            event_detection_explanation_by_ai: String::new(),
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(&sample_event("A"));

        assert_eq!(a.next().await.unwrap().event_code, "A");
        assert_eq!(b.next().await.unwrap().event_code, "A");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_the_fast_one() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_with_buffer(2);
        let mut fast = bus.subscribe_with_buffer(10);

        for i in 0..5 {
            bus.publish(&sample_event(&format!("E{i}")));
        }

        // The fast subscriber saw everything.
        for i in 0..5 {
            assert_eq!(fast.next().await.unwrap().event_code, format!("E{i}"));
        }

        // The slow one kept its first two events and lost the rest.
        assert_eq!(slow.next().await.unwrap().event_code, "E0");
        assert_eq!(slow.next().await.unwrap().event_code, "E1");
        slow.close();
        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(&sample_event("A"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(&sample_event("A"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
