//! Market Data Streaming Types
//!
//! The immutable `Update` that flows from the upstream feed through the
//! fan-out hub, and the per-topic sequence counter that stamps it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::subscription::Topic;

// =============================================================================
// Update
// =============================================================================

/// One market data update for a topic.
///
/// Cloning is cheap: the topic and payload are reference counted, so the
/// same update can sit in many connection queues at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    topic: Arc<str>,
    payload: Bytes,
    sequence: u64,
}

impl Update {
    /// Create a new update.
    #[must_use]
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            sequence,
        }
    }

    /// Topic this update belongs to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Opaque payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Per-topic sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

// =============================================================================
// Topic Sequencer
// =============================================================================

/// Hands out monotonically increasing sequence numbers per topic.
///
/// The first update of every topic gets sequence 1.
#[derive(Debug, Default)]
pub struct TopicSequencer {
    counters: Mutex<HashMap<Topic, u64>>,
}

impl TopicSequencer {
    /// Create a new sequencer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number for `topic`.
    pub fn next(&self, topic: &str) -> u64 {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get_mut(topic) {
            *counter += 1;
            return *counter;
        }
        counters.insert(topic.to_string(), 1);
        1
    }

    /// Build a sequenced update for `topic`.
    pub fn stamp(&self, topic: &str, payload: impl Into<Bytes>) -> Update {
        let sequence = self.next(topic);
        Update::new(topic, payload, sequence)
    }

    /// Last sequence handed out for `topic` (0 if none).
    #[must_use]
    pub fn current(&self, topic: &str) -> u64 {
        self.counters.lock().get(topic).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_per_topic() {
        let sequencer = TopicSequencer::new();

        assert_eq!(sequencer.next("BTC-PERPETUAL"), 1);
        assert_eq!(sequencer.next("BTC-PERPETUAL"), 2);
        assert_eq!(sequencer.next("ETH-PERPETUAL"), 1);
        assert_eq!(sequencer.current("BTC-PERPETUAL"), 2);
        assert_eq!(sequencer.current("SOL-PERPETUAL"), 0);
    }

    #[test]
    fn stamp_builds_update() {
        let sequencer = TopicSequencer::new();
        sequencer.next("BTC-PERPETUAL");

        let update = sequencer.stamp("BTC-PERPETUAL", &b"{\"bid\":1}"[..]);

        assert_eq!(update.topic(), "BTC-PERPETUAL");
        assert_eq!(update.sequence(), 2);
        assert_eq!(update.payload().as_ref(), b"{\"bid\":1}");
    }

    #[test]
    fn clones_share_payload() {
        let update = Update::new("BTC-PERPETUAL", Bytes::from_static(b"abc"), 7);
        let clone = update.clone();

        assert_eq!(update, clone);
        assert_eq!(clone.payload().as_ptr(), update.payload().as_ptr());
    }
}
