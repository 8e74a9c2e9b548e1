//! Outbound Queue
//!
//! Holds frames that could not be written: offered while the socket was
//! not open, or whose write failed. It is a safety net and normally empty,
//! since pings only start on an open socket and acknowledgments are produced
//! while frames arrive. Subscription control never lands here (the registry
//! is replayed on reconnect instead); only liveness and acknowledgment
//! traffic is queued. The engine flushes it in FIFO order on open, before
//! replaying subscriptions.
//!
//! The queue has a hard capacity. When full, the lowest-priority frame is
//! evicted, oldest first among equals, provided its priority does not
//! exceed the incoming frame's. Otherwise the incoming frame is rejected.
//! Finding the victim is a linear scan, which is fine at the default
//! capacity of 500.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::infrastructure::realtime::messages::{ClientMessage, Priority};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// A frame waiting for the socket.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The frame.
    pub message: ClientMessage,
    /// Priority captured at enqueue time.
    pub priority: Priority,
    /// When the frame was queued.
    pub enqueued_at: Instant,
    seq: u64,
}

/// Result of offering a frame to the queue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Queued without displacing anything.
    Queued,
    /// Queued after evicting the returned frame.
    Evicted(QueuedMessage),
    /// Queue full of higher-priority frames; the returned frame was not queued.
    Rejected(QueuedMessage),
}

/// Bounded priority-aware FIFO.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    items: VecDeque<QueuedMessage>,
    next_seq: u64,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    /// Create a queue (minimum capacity 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(64)),
            next_seq: 0,
        }
    }

    /// Queue a frame, evicting a lower-priority one if full.
    pub fn push(&mut self, message: ClientMessage) -> EnqueueOutcome {
        let entry = QueuedMessage {
            priority: message.priority(),
            message,
            enqueued_at: Instant::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if self.items.len() < self.capacity {
            self.items.push_back(entry);
            return EnqueueOutcome::Queued;
        }

        let victim = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| (item.priority, item.seq))
            .map(|(index, item)| (index, item.priority));

        match victim {
            Some((index, priority)) if priority <= entry.priority => {
                let evicted = self.items.remove(index);
                self.items.push_back(entry);
                evicted.map_or(EnqueueOutcome::Queued, EnqueueOutcome::Evicted)
            }
            _ => EnqueueOutcome::Rejected(entry),
        }
    }

    /// Take every queued frame in FIFO order.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    /// Put frames taken by [`drain`](Self::drain) back at the head, in order.
    pub fn restore(&mut self, unsent: Vec<QueuedMessage>) {
        for item in unsent.into_iter().rev() {
            self.items.push_front(item);
        }
        self.items.truncate(self.capacity);
    }

    /// Number of queued frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hard capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
