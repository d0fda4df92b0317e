//! Subscription Registry
//!
//! Tracks which topics each local client connection wants and answers the
//! fan-out question "who is subscribed to this topic?".
//!
//! # Design
//!
//! The registry is split into shards keyed by topic hash. Each shard owns
//! both halves of the relation for the topics that hash into it:
//! - connection → topics (restricted to this shard's topics)
//! - topic → connections
//!
//! Because a (connection, topic) pair lives in exactly one shard, a single
//! shard write lock updates both halves together, so a concurrent
//! `subscribers_of` never observes one half without the other. Writers on
//! topics in other shards are not blocked.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// Opaque identifier of a local client connection.
pub type ConnectionId = u64;

/// Topic key (an instrument name such as `BTC-PERPETUAL`).
pub type Topic = String;

/// Default number of registry shards.
pub const DEFAULT_SHARD_COUNT: usize = 16;

// =============================================================================
// Shard State
// =============================================================================

/// Both halves of the subscription relation for one shard.
#[derive(Debug, Default)]
struct ShardState {
    connection_topics: HashMap<ConnectionId, HashSet<Topic>>,
    topic_connections: HashMap<Topic, HashSet<ConnectionId>>,
}

impl ShardState {
    /// Returns `true` if the pair was not present before.
    fn add(&mut self, connection: ConnectionId, topic: &str) -> bool {
        let topics = self.connection_topics.entry(connection).or_default();
        if topics.contains(topic) {
            return false;
        }
        topics.insert(topic.to_string());

        self.topic_connections
            .entry(topic.to_string())
            .or_default()
            .insert(connection);
        true
    }

    /// Returns `true` if the pair was present.
    fn remove(&mut self, connection: ConnectionId, topic: &str) -> bool {
        let Some(topics) = self.connection_topics.get_mut(&connection) else {
            return false;
        };
        if !topics.remove(topic) {
            return false;
        }
        if topics.is_empty() {
            self.connection_topics.remove(&connection);
        }

        if let Some(connections) = self.topic_connections.get_mut(topic) {
            connections.remove(&connection);
            if connections.is_empty() {
                self.topic_connections.remove(topic);
            }
        }
        true
    }

    /// Remove every topic held by `connection` in this shard.
    fn remove_connection(&mut self, connection: ConnectionId) -> Vec<Topic> {
        let Some(topics) = self.connection_topics.remove(&connection) else {
            return vec![];
        };

        for topic in &topics {
            if let Some(connections) = self.topic_connections.get_mut(topic) {
                connections.remove(&connection);
                if connections.is_empty() {
                    self.topic_connections.remove(topic);
                }
            }
        }

        topics.into_iter().collect()
    }

    fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topic_connections
            .get(topic)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    fn subscription_count(&self) -> usize {
        self.connection_topics.values().map(HashSet::len).sum()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Sharded topic ↔ connection index.
///
/// Subscribing twice is a no-op, as is unsubscribing from a topic that is
/// not held.
///
/// # Example
///
/// ```rust
/// use deribit_gateway::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::default();
///
/// assert!(registry.subscribe(1, "BTC-PERPETUAL"));
/// assert!(!registry.subscribe(1, "BTC-PERPETUAL"));
/// registry.subscribe(2, "ETH-PERPETUAL");
///
/// assert_eq!(registry.subscribers_of("BTC-PERPETUAL"), vec![1]);
///
/// registry.drop_connection(1);
/// assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry {
    shards: Box<[RwLock<ShardState>]>,
    hasher: RandomState,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl SubscriptionRegistry {
    /// Create a registry with `shard_count` shards (at least one).
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(ShardState::default()))
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Subscribe `connection` to `topic`.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(&self, connection: ConnectionId, topic: &str) -> bool {
        self.shard(topic).write().add(connection, topic)
    }

    /// Subscribe `connection` to each topic, returning the ones that were new.
    pub fn subscribe_many(&self, connection: ConnectionId, topics: &[Topic]) -> Vec<Topic> {
        topics
            .iter()
            .filter(|t| self.subscribe(connection, t))
            .cloned()
            .collect()
    }

    /// Unsubscribe `connection` from `topic`.
    ///
    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, connection: ConnectionId, topic: &str) -> bool {
        self.shard(topic).write().remove(connection, topic)
    }

    /// Unsubscribe `connection` from each topic, returning the ones that were held.
    pub fn unsubscribe_many(&self, connection: ConnectionId, topics: &[Topic]) -> Vec<Topic> {
        topics
            .iter()
            .filter(|t| self.unsubscribe(connection, t))
            .cloned()
            .collect()
    }

    /// Remove every subscription held by `connection`.
    ///
    /// Idempotent; returns the topics that were removed.
    pub fn drop_connection(&self, connection: ConnectionId) -> Vec<Topic> {
        self.shards
            .iter()
            .flat_map(|shard| shard.write().remove_connection(connection))
            .collect()
    }

    /// Connections currently subscribed to `topic` (no duplicates).
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.shard(topic).read().subscribers(topic)
    }

    /// Whether `connection` holds `topic`.
    #[must_use]
    pub fn is_subscribed(&self, connection: ConnectionId, topic: &str) -> bool {
        self.shard(topic)
            .read()
            .connection_topics
            .get(&connection)
            .is_some_and(|t| t.contains(topic))
    }

    /// Topics held by `connection`.
    #[must_use]
    pub fn topics_of(&self, connection: ConnectionId) -> Vec<Topic> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .connection_topics
                    .get(&connection)
                    .map(|t| t.iter().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Topics with at least one subscriber.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .topic_connections
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut connections = HashSet::new();
        let mut stats = RegistryStats::default();

        for shard in &*self.shards {
            let state = shard.read();
            stats.topic_count += state.topic_connections.len();
            stats.subscription_count += state.subscription_count();
            connections.extend(state.connection_topics.keys().copied());
        }

        stats.connection_count = connections.len();
        stats
    }

    fn shard(&self, topic: &str) -> &RwLock<ShardState> {
        let len = self.shards.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.hasher.hash_one(topic) % len) as usize;
        &self.shards[index]
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Topics with at least one subscriber.
    pub topic_count: usize,
    /// Connections holding at least one topic.
    pub connection_count: usize,
    /// Total (connection, topic) pairs.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
