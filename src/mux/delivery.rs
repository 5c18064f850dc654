//! Delivery channel map.
//!
//! Topic → subscriber name → bounded delivery channel, plus the `started`
//! flag, all behind one reader/writer lock. Registration and removal take the
//! write side; fan-out takes the read side so dispatch never observes a torn
//! registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

use super::{MuxError, Result};
use crate::client::ConsumerMessage;

/// Sending half of a subscriber's delivery channel.
pub(crate) type DeliverySender = mpsc::Sender<Arc<ConsumerMessage>>;

/// Result of fanning one message out to its topic's subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Subscribers that accepted the message within the bound.
    pub delivered: usize,
    /// Subscribers that timed out or dropped their receiver.
    pub dropped: usize,
}

impl DispatchOutcome {
    /// Number of delivery attempts made.
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped
    }
}

/// State guarded by the delivery map lock.
#[derive(Default)]
pub(crate) struct DeliveryState {
    /// Flips to `true` once in `Multiplexer::start` and never reverts.
    pub(crate) started: bool,
    topics: HashMap<String, HashMap<String, DeliverySender>>,
}

impl DeliveryState {
    /// Register `(topic, name)`.
    ///
    /// Returns the sender it replaced, if any. The replaced subscriber's
    /// receiver sees its channel close once that sender is dropped.
    pub(crate) fn insert(
        &mut self,
        topic: &str,
        name: &str,
        sender: DeliverySender,
    ) -> Result<Option<DeliverySender>> {
        if self.started {
            return Err(MuxError::AlreadyStarted);
        }
        Ok(self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(name.to_string(), sender))
    }

    /// Remove `(topic, name)`. A topic left without subscribers is forgotten.
    pub(crate) fn remove(&mut self, topic: &str, name: &str) -> Result<()> {
        let not_subscribed = || MuxError::NotSubscribed {
            topic: topic.to_string(),
            name: name.to_string(),
        };

        let subscribers = self.topics.get_mut(topic).ok_or_else(not_subscribed)?;
        subscribers.remove(name).ok_or_else(not_subscribed)?;

        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        Ok(())
    }

    /// Distinct subscribed topics, sorted.
    pub(crate) fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashMap::len)
    }
}

/// Concurrency-safe delivery channel map with bounded-wait fan-out.
pub(crate) struct DeliveryMap {
    state: RwLock<DeliveryState>,
    delivery_timeout: Duration,
}

impl DeliveryMap {
    pub(crate) fn new(delivery_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(DeliveryState::default()),
            delivery_timeout,
        }
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, DeliveryState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, DeliveryState> {
        self.state.write().await
    }

    /// Deliver `message` to every subscriber of its topic.
    ///
    /// Each subscriber gets its own `delivery_timeout`; a subscriber that
    /// cannot accept in time misses this message and the others are
    /// unaffected.
    pub(crate) async fn dispatch(&self, message: Arc<ConsumerMessage>) -> DispatchOutcome {
        let state = self.state.read().await;
        let mut outcome = DispatchOutcome::default();

        let Some(subscribers) = state.topics.get(&message.topic) else {
            debug!(topic = %message.topic, "No subscribers for topic, message dropped");
            return outcome;
        };

        for (name, sender) in subscribers {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                subscriber = %name,
                "Delivering message"
            );

            match tokio::time::timeout(self.delivery_timeout, sender.send(Arc::clone(&message)))
                .await
            {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(_)) => {
                    warn!(
                        topic = %message.topic,
                        subscriber = %name,
                        "Subscriber receiver dropped, message not delivered"
                    );
                    outcome.dropped += 1;
                }
                Err(_) => {
                    error!(
                        topic = %message.topic,
                        offset = message.offset,
                        subscriber = %name,
                        timeout_ms = self.delivery_timeout.as_millis() as u64,
                        "Unable to deliver message before the timeout"
                    );
                    outcome.dropped += 1;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_message(topic: &str, offset: i64) -> Arc<ConsumerMessage> {
        Arc::new(ConsumerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: Some(Bytes::from_static(b"k1")),
            value: Bytes::from_static(b"v1"),
            timestamp: None,
        })
    }

    #[test]
    fn test_insert_creates_topic() {
        let mut state = DeliveryState::default();
        let (tx, _rx) = mpsc::channel(1);

        assert!(state.insert("orders", "billing", tx).unwrap().is_none());
        assert_eq!(state.topics(), vec!["orders".to_string()]);
        assert_eq!(state.subscriber_count("orders"), 1);
    }

    #[test]
    fn test_insert_duplicate_replaces() {
        let mut state = DeliveryState::default();
        let (first, _first_rx) = mpsc::channel(1);
        let (second, _second_rx) = mpsc::channel(1);

        state.insert("orders", "billing", first).unwrap();
        let replaced = state.insert("orders", "billing", second).unwrap();

        assert!(replaced.is_some());
        assert_eq!(state.subscriber_count("orders"), 1);
    }

    #[test]
    fn test_insert_after_start_fails() {
        let mut state = DeliveryState::default();
        state.started = true;
        let (tx, _rx) = mpsc::channel(1);

        let result = state.insert("orders", "billing", tx);

        assert!(matches!(result, Err(MuxError::AlreadyStarted)));
        assert!(state.topics().is_empty());
    }

    #[test]
    fn test_remove_unknown_topic() {
        let mut state = DeliveryState::default();
        let result = state.remove("orders", "billing");
        assert!(matches!(result, Err(MuxError::NotSubscribed { .. })));
    }

    #[test]
    fn test_remove_unknown_name() {
        let mut state = DeliveryState::default();
        let (tx, _rx) = mpsc::channel(1);
        state.insert("orders", "shipping", tx).unwrap();

        let result = state.remove("orders", "billing");

        match result {
            Err(MuxError::NotSubscribed { topic, name }) => {
                assert_eq!(topic, "orders");
                assert_eq!(name, "billing");
            }
            other => panic!("expected NotSubscribed, got {:?}", other),
        }
        assert_eq!(state.subscriber_count("orders"), 1);
    }

    #[test]
    fn test_remove_last_subscriber_forgets_topic() {
        let mut state = DeliveryState::default();
        let (tx, _rx) = mpsc::channel(1);
        state.insert("orders", "billing", tx).unwrap();

        state.remove("orders", "billing").unwrap();

        assert!(state.topics().is_empty());
    }

    #[test]
    fn test_topics_are_distinct() {
        let mut state = DeliveryState::default();
        for (topic, name) in [
            ("orders", "billing"),
            ("orders", "shipping"),
            ("payments", "billing"),
        ] {
            let (tx, _rx) = mpsc::channel(1);
            state.insert(topic, name, tx).unwrap();
        }

        assert_eq!(
            state.topics(),
            vec!["orders".to_string(), "payments".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_all_subscribers() {
        let map = DeliveryMap::new(Duration::from_secs(1));
        let (billing, mut billing_rx) = mpsc::channel(1);
        let (shipping, mut shipping_rx) = mpsc::channel(1);
        {
            let mut state = map.write().await;
            state.insert("orders", "billing", billing).unwrap();
            state.insert("orders", "shipping", shipping).unwrap();
        }

        let outcome = map.dispatch(make_message("orders", 0)).await;

        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.dropped, 0);
        assert_eq!(billing_rx.recv().await.unwrap().key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(shipping_rx.recv().await.unwrap().value, Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers() {
        let map = DeliveryMap::new(Duration::from_secs(1));
        let outcome = map.dispatch(make_message("orders", 0)).await;
        assert_eq!(outcome.attempted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_saturated_subscriber_does_not_block_others() {
        let map = DeliveryMap::new(Duration::from_secs(1));
        let (slow, mut slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = mpsc::channel(1);
        {
            let mut state = map.write().await;
            state.insert("orders", "slow", slow).unwrap();
            state.insert("orders", "fast", fast).unwrap();
        }

        // Fill the slow subscriber's only slot.
        assert_eq!(map.dispatch(make_message("orders", 0)).await.delivered, 2);
        fast_rx.recv().await.unwrap();

        let outcome = map.dispatch(make_message("orders", 1)).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(fast_rx.recv().await.unwrap().offset, 1);
        assert_eq!(slow_rx.recv().await.unwrap().offset, 0);
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_dropped_receiver() {
        let map = DeliveryMap::new(Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(1);
        map.write().await.insert("orders", "gone", tx).unwrap();
        drop(rx);

        let outcome = map.dispatch(make_message("orders", 0)).await;

        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.dropped, 1);
    }
}
