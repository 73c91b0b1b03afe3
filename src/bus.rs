//! Event Bus
//!
//! In-process typed publish/subscribe. Topics are strings; a subscriber
//! pattern is either a literal topic or a prefix ending in `*`.
//!
//! Each subscriber owns bounded queues. Overflow policy is per topic class:
//! market-data topics drop the oldest event, account/order topics block the
//! publisher up to a deadline and then fail with `Backpressure`. Delivery is
//! FIFO per (publisher, subscriber) within a topic class, and events are
//! value-copied into subscriber queues - no shared mutation.

use crate::error::{CoreError, CoreResult};
use crate::events::BusEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Topic overflow class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    /// Bounded queue, drop-oldest on overflow. Publish never fails.
    Lossy,
    /// Bounded queue, publisher blocks up to the deadline then errors.
    Reliable,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Per-subscriber queue capacity.
    pub queue_size: usize,
    /// How long a reliable publish may block before `Backpressure`.
    pub publish_deadline: Duration,
    /// Topic prefixes treated as reliable; everything else is lossy.
    pub reliable_prefixes: Vec<String>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            publish_deadline: Duration::from_millis(500),
            reliable_prefixes: vec!["account.".to_string(), "order.".to_string()],
        }
    }
}

/// An event as delivered to a subscriber.
pub type Published = (String, BusEvent);

struct SubscriberEntry {
    id: u64,
    pattern: String,
    lossy_tx: broadcast::Sender<Published>,
    reliable_tx: mpsc::Sender<Published>,
}

/// Handle owned by a subscriber; receives matching events.
pub struct Subscription {
    id: u64,
    lossy_rx: broadcast::Receiver<Published>,
    reliable_rx: mpsc::Receiver<Published>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, skipping over any lossy overflow gaps.
    /// Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Published> {
        loop {
            tokio::select! {
                biased;
                reliable = self.reliable_rx.recv() => {
                    match reliable {
                        Some(item) => return Some(item),
                        None => return self.recv_lossy().await,
                    }
                }
                lossy = self.lossy_rx.recv() => {
                    match lossy {
                        Ok(item) => return Some(item),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "bus subscriber lagged; oldest events dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return self.reliable_rx.recv().await;
                        }
                    }
                }
            }
        }
    }

    async fn recv_lossy(&mut self) -> Option<Published> {
        loop {
            match self.lossy_rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Published> {
        if let Ok(item) = self.reliable_rx.try_recv() {
            return Some(item);
        }
        loop {
            match self.lossy_rx.try_recv() {
                Ok(item) => return Some(item),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// In-process typed publish/subscribe bus.
pub struct EventBus {
    config: EventBusConfig,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Classify a topic by configured reliable prefixes.
    pub fn classify(&self, topic: &str) -> TopicClass {
        if self
            .config
            .reliable_prefixes
            .iter()
            .any(|p| topic.starts_with(p.as_str()))
        {
            TopicClass::Reliable
        } else {
            TopicClass::Lossy
        }
    }

    /// Register a subscriber for a literal topic or trailing-`*` prefix.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let pattern = pattern.into();
        let (lossy_tx, lossy_rx) = broadcast::channel(self.config.queue_size.max(1));
        let (reliable_tx, reliable_rx) = mpsc::channel(self.config.queue_size.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.write().push(SubscriberEntry {
            id,
            pattern,
            lossy_tx,
            reliable_tx,
        });

        Subscription {
            id,
            lossy_rx,
            reliable_rx,
        }
    }

    /// Remove a subscriber by handle id.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Publish an event. Lossy topics never fail; reliable topics block up to
    /// the configured deadline per congested subscriber, then fail.
    pub async fn publish(&self, topic: &str, event: BusEvent) -> CoreResult<()> {
        let class = self.classify(topic);

        // Snapshot matching senders so the lock is not held across awaits.
        let matched: Vec<(u64, broadcast::Sender<Published>, mpsc::Sender<Published>)> = {
            let subs = self.subscribers.read();
            subs.iter()
                .filter(|s| pattern_matches(&s.pattern, topic))
                .map(|s| (s.id, s.lossy_tx.clone(), s.reliable_tx.clone()))
                .collect()
        };

        let mut dead: Vec<u64> = Vec::new();

        match class {
            TopicClass::Lossy => {
                for (id, lossy_tx, _) in &matched {
                    // A send error means the receiver was dropped.
                    if lossy_tx.send((topic.to_string(), event.clone())).is_err() {
                        dead.push(*id);
                    }
                }
            }
            TopicClass::Reliable => {
                for (id, _, reliable_tx) in &matched {
                    let item = (topic.to_string(), event.clone());
                    match reliable_tx
                        .send_timeout(item, self.config.publish_deadline)
                        .await
                    {
                        Ok(()) => {}
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            self.prune(&dead);
                            return Err(CoreError::Backpressure(format!(
                                "publish deadline exceeded on topic {}",
                                topic
                            )));
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            dead.push(*id);
                        }
                    }
                }
            }
        }

        self.prune(&dead);
        Ok(())
    }

    fn prune(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        self.subscribers.write().retain(|s| !dead.contains(&s.id));
    }
}

/// Literal match, or prefix match when the pattern ends with `*`.
fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{StatusEvent, TradeEvent};
    use crate::events::MarketEvent;
    use crate::types::{Side, TradingPair};
    use rust_decimal_macros::dec;

    fn trade_event() -> BusEvent {
        BusEvent::Market(MarketEvent::Trade(TradeEvent {
            pair: TradingPair::new("BTC", "USDC"),
            price: dec!(100),
            size: dec!(1),
            side: Side::Buy,
            ts: 1,
        }))
    }

    fn status_event(runner: &str) -> BusEvent {
        BusEvent::Status(StatusEvent {
            runner_id: runner.to_string(),
            status: "running".to_string(),
            ts: 1,
        })
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("market.hl.BTC-USDC.trade", "market.hl.BTC-USDC.trade"));
        assert!(pattern_matches("market.*", "market.hl.BTC-USDC.trade"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("market.*", "account.hl.fill"));
        assert!(!pattern_matches("market.hl.BTC-USDC.trade", "market.hl.BTC-USDC.book"));
    }

    #[tokio::test]
    async fn test_publish_subscribe_literal() {
        let bus = EventBus::new(EventBusConfig::default());
        let mut sub = bus.subscribe("market.hl.BTC-USDC.trade");

        bus.publish("market.hl.BTC-USDC.trade", trade_event())
            .await
            .unwrap();
        bus.publish("market.hl.ETH-USDC.trade", trade_event())
            .await
            .unwrap();

        let (topic, _) = sub.recv().await.unwrap();
        assert_eq!(topic, "market.hl.BTC-USDC.trade");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lossy_overflow_drops_oldest() {
        let bus = EventBus::new(EventBusConfig {
            queue_size: 4,
            ..Default::default()
        });
        let mut sub = bus.subscribe("market.*");

        for i in 0..8 {
            let mut event = status_event(&format!("{}", i));
            if let BusEvent::Status(ref mut s) = event {
                s.ts = i;
            }
            // Status events are lossy under default prefixes when published
            // on a market topic.
            bus.publish("market.tick", event).await.unwrap();
        }

        // The first events were dropped; delivery resumes from the oldest
        // retained one and stays FIFO.
        let (_, first) = sub.recv().await.unwrap();
        match first {
            BusEvent::Status(s) => assert_eq!(s.ts, 4),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reliable_backpressure() {
        let bus = EventBus::new(EventBusConfig {
            queue_size: 1,
            publish_deadline: Duration::from_millis(20),
            ..Default::default()
        });
        let _sub = bus.subscribe("account.*");

        bus.publish("account.hl.fill", status_event("a"))
            .await
            .unwrap();
        let err = bus
            .publish("account.hl.fill", status_event("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Backpressure(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new(EventBusConfig::default());
        let sub = bus.subscribe("market.*");
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned_on_publish() {
        let bus = EventBus::new(EventBusConfig::default());
        let sub = bus.subscribe("market.*");
        drop(sub);
        bus.publish("market.tick", status_event("x")).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
