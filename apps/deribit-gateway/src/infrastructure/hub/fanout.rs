//! Fan-Out Hub
//!
//! Owns the subscription registry and the table of live connections, turns
//! client frames into registry mutations, and fans published updates out to
//! per-connection queues.
//!
//! `publish` only touches in-memory queues. Network writes happen in each
//! connection's writer task, so a slow subscriber never holds up the feed
//! or other subscribers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{ConnectionHandle, ControlSendError};
use super::protocol::{ClientMessage, ProtocolError, ServerFrame};
use super::queue::PushOutcome;
use crate::application::ports::{PublishReport, UpdateSink};
use crate::domain::streaming::Update;
use crate::domain::subscription::{ConnectionId, SubscriptionRegistry};
use crate::infrastructure::config::HubSettings;
use crate::infrastructure::metrics::{record_publish, set_active_topics, set_client_connections};

/// Default capacity of each connection's control frame channel.
pub const DEFAULT_CONTROL_CAPACITY: usize = 32;

// =============================================================================
// Configuration
// =============================================================================

/// Hub configuration.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Per-connection outbound update queue capacity.
    pub queue_capacity: usize,
    /// Per-connection control frame channel capacity.
    pub control_capacity: usize,
    /// Time a closing connection gets to flush its queue.
    pub drain_timeout: Duration,
    /// Number of registry shards.
    pub registry_shards: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
            drain_timeout: settings.drain_timeout,
            registry_shards: settings.registry_shards,
        }
    }
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered connections.
    pub connections: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Total (connection, topic) pairs.
    pub subscriptions: usize,
    /// Whether the subscriber listener is accepting connections.
    pub listening: bool,
}

// =============================================================================
// Hub
// =============================================================================

/// Topic-indexed fan-out to local subscribers.
#[derive(Debug)]
pub struct FanOutHub {
    registry: SubscriptionRegistry,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    next_id: AtomicU64,
    listening: AtomicBool,
    config: HubConfig,
}

impl Default for FanOutHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl FanOutHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(config.registry_shards),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listening: AtomicBool::new(false),
            config,
        }
    }

    /// Hub configuration.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a new connection in the `Connecting` state.
    ///
    /// Returns the handle and the receiving end of its control channel.
    /// Every registered connection must eventually be passed to
    /// [`drop_connection`](Self::drop_connection).
    pub fn register(
        &self,
        peer: Option<SocketAddr>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, control_rx) = ConnectionHandle::new(
            id,
            peer,
            self.config.queue_capacity,
            self.config.control_capacity,
        );
        let handle = Arc::new(handle);

        let count = {
            let mut connections = self.connections.write();
            connections.insert(id, Arc::clone(&handle));
            connections.len()
        };
        set_client_connections(count);

        (handle, control_rx)
    }

    /// Look up a registered connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().get(&id).cloned()
    }

    /// Apply one client text frame.
    ///
    /// Refused frames are logged and answered with an `error` frame; the
    /// connection stays open.
    pub fn handle_text(&self, conn: &ConnectionHandle, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Subscribe { topics }) => {
                let added = self.registry.subscribe_many(conn.id(), &topics);
                debug!(
                    connection_id = conn.id(),
                    requested = topics.len(),
                    added = added.len(),
                    "Subscribed"
                );
                self.refresh_topic_gauge();
                self.reply(conn, ServerFrame::Subscribed { topics });
            }
            Ok(ClientMessage::Unsubscribe { topics }) => {
                let removed = self.registry.unsubscribe_many(conn.id(), &topics);
                debug!(
                    connection_id = conn.id(),
                    requested = topics.len(),
                    removed = removed.len(),
                    "Unsubscribed"
                );
                self.refresh_topic_gauge();
                self.reply(conn, ServerFrame::Unsubscribed { topics });
            }
            Ok(ClientMessage::Ping) => self.reply(conn, ServerFrame::Pong),
            Err(e) => self.reject(conn, &e),
        }
    }

    /// Log a refused client frame and tell the client why.
    pub fn reject(&self, conn: &ConnectionHandle, error: &ProtocolError) {
        warn!(connection_id = conn.id(), error = %error, "Dropping client message");
        self.reply(
            conn,
            ServerFrame::Error {
                message: error.to_string(),
            },
        );
    }

    fn reply(&self, conn: &ConnectionHandle, frame: ServerFrame) {
        match conn.send_control(frame) {
            Ok(()) => {}
            Err(ControlSendError::Full) => {
                warn!(
                    connection_id = conn.id(),
                    capacity = self.config.control_capacity,
                    "Control channel full, closing connection"
                );
                conn.begin_close();
            }
            Err(ControlSendError::Closed) => {
                debug!(connection_id = conn.id(), "Writer gone, reply discarded");
            }
        }
    }

    /// Remove a connection from the hub and from every topic it held.
    ///
    /// Returns true the first time for a given id and false afterwards.
    pub fn drop_connection(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.connections.write();
            (connections.remove(&id), connections.len())
        };
        let Some(conn) = removed else {
            return false;
        };

        conn.mark_closed();
        let topics = self.registry.drop_connection(id);
        debug!(connection_id = id, topics = topics.len(), "Connection dropped");

        set_client_connections(count);
        self.refresh_topic_gauge();
        true
    }

    /// Mark the listener as accepting (or no longer accepting) connections.
    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
    }

    /// Whether the listener is accepting connections.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Move every connection to `Closing` so their queues drain.
    ///
    /// Returns the number of connections that began closing.
    pub fn begin_shutdown(&self) -> usize {
        self.set_listening(false);
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections.iter().filter(|c| c.begin_close()).count()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        HubStats {
            connections: self.connections.read().len(),
            topics: registry.topic_count,
            subscriptions: registry.subscription_count,
            listening: self.is_listening(),
        }
    }

    fn refresh_topic_gauge(&self) {
        set_active_topics(self.registry.stats().topic_count);
    }
}

impl UpdateSink for FanOutHub {
    fn publish(&self, update: Update) -> PublishReport {
        let subscribers = self.registry.subscribers_of(update.topic());

        let targets: Vec<Arc<ConnectionHandle>> = if subscribers.is_empty() {
            Vec::new()
        } else {
            let connections = self.connections.read();
            subscribers
                .iter()
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };

        let mut report = PublishReport::default();
        for conn in &targets {
            match conn.enqueue(update.clone()) {
                PushOutcome::Queued { evicted } => {
                    report.delivered += 1;
                    if evicted {
                        report.evicted += 1;
                    }
                }
                PushOutcome::Stale => report.stale += 1,
                PushOutcome::Closed => {}
            }
        }

        record_publish(report.delivered, report.evicted, report.stale);
        report
    }
}

// =============================================================================
// Tests
// =============================================================================
