// =============================================================================
// Order Queue — bounded primary buffer with an overflow spill
// =============================================================================
//
// When the primary buffer is full an incoming order spills into the
// secondary overflow buffer; when that is also full the incoming order is
// dropped and counted. Dequeue order: primary first, overflow promoted as
// the primary frees up. Drains are cooperative — back-pressure comes only
// from the caller's own scheduling.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::Order;

/// Point-in-time queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub dequeued: u64,
    pub overflowed: u64,
    pub dropped: u64,
    pub current_depth: usize,
    pub overflow_depth: usize,
}

struct Buffers {
    primary: VecDeque<Order>,
    overflow: VecDeque<Order>,
}

pub struct OrderQueue {
    buffers: Mutex<Buffers>,
    primary_cap: usize,
    overflow_cap: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    overflowed: AtomicU64,
    dropped: AtomicU64,
    notify: Notify,
}

impl OrderQueue {
    pub fn new(primary_cap: usize, overflow_cap: usize) -> Self {
        Self {
            buffers: Mutex::new(Buffers {
                primary: VecDeque::with_capacity(primary_cap),
                overflow: VecDeque::with_capacity(overflow_cap),
            }),
            primary_cap: primary_cap.max(1),
            overflow_cap,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue an order. Returns `false` when both buffers are full and the
    /// incoming order was dropped.
    pub fn enqueue(&self, order: Order) -> bool {
        let accepted = {
            let mut bufs = self.buffers.lock();
            if bufs.primary.len() < self.primary_cap {
                bufs.primary.push_back(order);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            } else if bufs.overflow.len() < self.overflow_cap {
                bufs.overflow.push_back(order);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                debug!("order spilled to overflow buffer");
                true
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(order_id = %order.id, "order queue saturated — order dropped");
                false
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Pop the next order: primary first, then promote from overflow.
    pub fn pop(&self) -> Option<Order> {
        let mut bufs = self.buffers.lock();
        let order = bufs
            .primary
            .pop_front()
            .or_else(|| bufs.overflow.pop_front())?;
        // Promote spilled orders so the primary buffer refills in order.
        while bufs.primary.len() < self.primary_cap {
            match bufs.overflow.pop_front() {
                Some(o) => bufs.primary.push_back(o),
                None => break,
            }
        }
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(order)
    }

    /// Await the next order.
    pub async fn recv(&self) -> Order {
        loop {
            if let Some(order) = self.pop() {
                return order;
            }
            self.notify.notified().await;
        }
    }

    /// Cooperatively hand every currently queued order to `handler`.
    pub async fn drain<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(Order) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(order) = self.pop() {
            handler(order).await;
        }
    }

    pub fn len(&self) -> usize {
        let bufs = self.buffers.lock();
        bufs.primary.len() + bufs.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total notional value of queued orders across both buffers.
    pub fn pending_notional(&self) -> f64 {
        let bufs = self.buffers.lock();
        bufs.primary
            .iter()
            .chain(bufs.overflow.iter())
            .map(Order::notional)
            .sum()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let bufs = self.buffers.lock();
        QueueMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            current_depth: bufs.primary.len(),
            overflow_depth: bufs.overflow.len(),
        }
    }
}
