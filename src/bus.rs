// =============================================================================
// Event Bus — typed topic broker with bounded per-subscriber queues
// =============================================================================
//
// Each subscriber owns an independent bounded buffer. When a buffer is full
// the publisher drops the oldest undelivered payload for that subscriber and
// never blocks. Ordering is preserved per subscriber per topic; nothing is
// guaranteed across topics.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use crate::risk::RiskDecision;
use crate::types::{Order, OrderUpdate, PriceTick, Signal};

// ---------------------------------------------------------------------------
// Topics and payloads
// ---------------------------------------------------------------------------

/// Closed enumeration of bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PriceTick,
    OrderUpdate,
    StrategySignal,
    RiskAlert,
    PositionChange,
    OrderSubmitted,
    OrderAccepted,
    OrderRejected,
    OrderFilled,
    OrderPartiallyFilled,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PriceTick => "price_tick",
            Self::OrderUpdate => "order_update",
            Self::StrategySignal => "strategy_signal",
            Self::RiskAlert => "risk_alert",
            Self::PositionChange => "position_change",
            Self::OrderSubmitted => "order.submitted",
            Self::OrderAccepted => "order.accepted",
            Self::OrderRejected => "order.rejected",
            Self::OrderFilled => "order.filled",
            Self::OrderPartiallyFilled => "order.partially_filled",
        };
        write!(f, "{s}")
    }
}

/// A risk rejection or warning surfaced to subscribers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskAlert {
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub decision: RiskDecision,
    pub at: String,
}

/// A change to a persisted position row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionChange {
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
}

/// Immutable payload published on the bus. Subscribers receive shared
/// references and must not mutate.
#[derive(Debug, Clone)]
pub enum Event {
    Tick(PriceTick),
    Signal(Signal),
    Order(Order),
    OrderUpdate(OrderUpdate),
    RiskAlert(RiskAlert),
    PositionChange(PositionChange),
}

// ---------------------------------------------------------------------------
// Subscriber queue
// ---------------------------------------------------------------------------

struct SubQueue {
    topic: Topic,
    buf: Mutex<VecDeque<Arc<Event>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubQueue {
    /// Push an event, evicting the oldest undelivered payload when full.
    fn push(&self, event: Arc<Event>) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }
}

/// Receiving end of a subscription. Dropping it detaches the subscriber.
pub struct Subscription {
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Await the next event. Returns `None` only if the buffer is empty and
    /// the subscription has been closed.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        loop {
            if let Some(ev) = self.queue.buf.lock().pop_front() {
                return Some(ev);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking pop, for tests and cooperative drains.
    pub fn try_recv(&self) -> Option<Arc<Event>> {
        self.queue.buf.lock().pop_front()
    }

    /// Number of payloads dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn topic(&self) -> Topic {
        self.queue.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Topic-keyed publish/subscribe broker.
pub struct EventBus {
    topics: RwLock<HashMap<Topic, Vec<Arc<SubQueue>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber with its own bounded buffer of `capacity`.
    pub fn subscribe(&self, topic: Topic, capacity: usize) -> Subscription {
        let queue = Arc::new(SubQueue {
            topic,
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.topics
            .write()
            .entry(topic)
            .or_default()
            .push(queue.clone());
        debug!(topic = %topic, capacity, "bus subscriber registered");
        Subscription { queue }
    }

    /// Publish to every live subscriber of `topic`. Never blocks.
    pub fn publish(&self, topic: Topic, event: Event) {
        let event = Arc::new(event);
        let mut prune = false;
        {
            let topics = self.topics.read();
            if let Some(subs) = topics.get(&topic) {
                for sub in subs {
                    if sub.closed.load(Ordering::Acquire) {
                        prune = true;
                        continue;
                    }
                    sub.push(event.clone());
                }
            }
        }
        if prune {
            self.topics
                .write()
                .entry(topic)
                .or_default()
                .retain(|s| !s.closed.load(Ordering::Acquire));
        }
    }

    /// Current subscriber count for a topic (closed subscribers excluded).
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .get(&topic)
            .map(|subs| {
                subs.iter()
                    .filter(|s| !s.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalAction;

    fn tick(symbol: &str, price: f64) -> Event {
        Event::Tick(PriceTick {
            symbol: symbol.to_string(),
            price,
            ts: 0,
        })
    }

    fn tick_price(ev: &Event) -> f64 {
        match ev {
            Event::Tick(t) => t.price,
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn fifo_per_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::PriceTick, 8);
        for p in [1.0, 2.0, 3.0] {
            bus.publish(Topic::PriceTick, tick("BTCUSDT", p));
        }
        assert_eq!(tick_price(&sub.try_recv().unwrap()), 1.0);
        assert_eq!(tick_price(&sub.try_recv().unwrap()), 2.0);
        assert_eq!(tick_price(&sub.try_recv().unwrap()), 3.0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::PriceTick, 2);
        for p in [1.0, 2.0, 3.0, 4.0] {
            bus.publish(Topic::PriceTick, tick("BTCUSDT", p));
        }
        // Oldest two were evicted; survivors are the newest two in order.
        assert_eq!(tick_price(&sub.try_recv().unwrap()), 3.0);
        assert_eq!(tick_price(&sub.try_recv().unwrap()), 4.0);
        assert_eq!(sub.dropped(), 2);
    }

    #[test]
    fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let slow = bus.subscribe(Topic::PriceTick, 1);
        let fast = bus.subscribe(Topic::PriceTick, 16);
        for p in [1.0, 2.0, 3.0] {
            bus.publish(Topic::PriceTick, tick("BTCUSDT", p));
        }
        assert_eq!(tick_price(&slow.try_recv().unwrap()), 3.0);
        assert_eq!(tick_price(&fast.try_recv().unwrap()), 1.0);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn topics_are_independent() {
        let bus = EventBus::new();
        let ticks = bus.subscribe(Topic::PriceTick, 4);
        let signals = bus.subscribe(Topic::StrategySignal, 4);
        bus.publish(Topic::PriceTick, tick("ETHUSDT", 5.0));
        bus.publish(
            Topic::StrategySignal,
            Event::Signal(Signal {
                strategy_id: "s1".into(),
                action: SignalAction::Buy,
                symbol: "ETHUSDT".into(),
                size: 1.0,
                note: None,
            }),
        );
        assert!(ticks.try_recv().is_some());
        assert!(ticks.try_recv().is_none());
        assert!(signals.try_recv().is_some());
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::PriceTick, 4);
        assert_eq!(bus.subscriber_count(Topic::PriceTick), 1);
        drop(sub);
        bus.publish(Topic::PriceTick, tick("BTCUSDT", 1.0));
        assert_eq!(bus.subscriber_count(Topic::PriceTick), 0);
    }

    #[tokio::test]
    async fn async_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(Topic::PriceTick, 4);
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish(Topic::PriceTick, tick("BTCUSDT", 9.0));
        });
        let ev = sub.recv().await.unwrap();
        assert_eq!(tick_price(&ev), 9.0);
        handle.await.unwrap();
    }
}
