//! Per-Connection Outbound Queue
//!
//! Bounded, drop-oldest queue of updates waiting to be written to one
//! subscriber. The publisher never waits on it: when the queue is full the
//! oldest update is evicted to make room.
//!
//! The queue also remembers the last sequence it accepted for each topic
//! and refuses anything older, so a connection only ever sees
//! non-decreasing sequences per topic.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::streaming::Update;

/// Result of offering an update to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued; `evicted` is true if the oldest update was dropped for room.
    Queued {
        /// Whether an older update was evicted.
        evicted: bool,
    },
    /// Refused: older than the last update queued for its topic.
    Stale,
    /// Refused: the queue is closed.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Update>,
    last_sequence: HashMap<String, u64>,
    closed: bool,
}

/// Bounded drop-oldest queue with a single consumer.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` updates (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Maximum number of queued updates.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer an update. Never blocks.
    pub fn push(&self, update: Update) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let sequence = update.sequence();
            if let Some(&last) = state.last_sequence.get(update.topic()) {
                if sequence < last {
                    return PushOutcome::Stale;
                }
            }
            state
                .last_sequence
                .insert(update.topic().to_string(), sequence);

            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front();
                true
            } else {
                false
            };
            state.items.push_back(update);
            PushOutcome::Queued { evicted }
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next update.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<Update> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(update) = state.items.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take the next update without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<Update> {
        self.state.lock().items.pop_front()
    }

    /// Stop accepting updates. Already queued updates can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queued updates, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Update> {
        self.state.lock().items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn update(topic: &str, sequence: u64) -> Update {
        Update::new(topic, format!("{{\"n\":{sequence}}}"), sequence)
    }

    #[test]
    fn keeps_most_recent_when_full() {
        let queue = OutboundQueue::new(3);

        let outcomes: Vec<_> = (1..=5).map(|n| queue.push(update("BTC", n))).collect();

        assert_eq!(
            outcomes,
            vec![
                PushOutcome::Queued { evicted: false },
                PushOutcome::Queued { evicted: false },
                PushOutcome::Queued { evicted: false },
                PushOutcome::Queued { evicted: true },
                PushOutcome::Queued { evicted: true },
            ]
        );
        let sequences: Vec<_> = queue.snapshot().iter().map(Update::sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[test]
    fn refuses_stale_update_per_topic() {
        let queue = OutboundQueue::new(8);

        assert!(matches!(queue.push(update("BTC", 5)), PushOutcome::Queued { .. }));
        assert_eq!(queue.push(update("BTC", 4)), PushOutcome::Stale);
        assert!(matches!(queue.push(update("BTC", 5)), PushOutcome::Queued { .. }));
        assert!(matches!(queue.push(update("ETH", 1)), PushOutcome::Queued { .. }));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn closed_queue_refuses() {
        let queue = OutboundQueue::new(2);
        queue.push(update("BTC", 1));
        queue.close();

        assert_eq!(queue.push(update("BTC", 2)), PushOutcome::Closed);
        assert!(queue.is_closed());
        assert_eq!(queue.try_pop().map(|u| u.sequence()), Some(1));
    }

    #[test]
    fn zero_capacity_clamped() {
        let queue = OutboundQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(update("BTC", 1));

        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.sequence(), 1);
    }

    #[tokio::test]
    async fn pop_drains_then_ends_after_close() {
        let queue = OutboundQueue::new(4);
        queue.push(update("BTC", 1));
        queue.push(update("BTC", 2));
        queue.close();

        assert_eq!(queue.pop().await.map(|u| u.sequence()), Some(1));
        assert_eq!(queue.pop().await.map(|u| u.sequence()), Some(2));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert!(consumer.await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn holds_last_k_in_order(capacity in 1usize..16, count in 0u64..64) {
            let queue = OutboundQueue::new(capacity);
            for n in 1..=count {
                queue.push(update("BTC", n));
            }

            let held: Vec<_> = queue.snapshot().iter().map(Update::sequence).collect();
            let start = count.saturating_sub(capacity as u64) + 1;
            let expected: Vec<_> = (start..=count).collect();
            prop_assert_eq!(held, expected);
        }

        #[test]
        fn delivered_sequences_never_decrease(sequences in prop::collection::vec(0u64..50, 0..100)) {
            let queue = OutboundQueue::new(8);
            for s in sequences {
                queue.push(update("BTC", s));
            }

            let held: Vec<_> = queue.snapshot().iter().map(Update::sequence).collect();
            prop_assert!(held.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
