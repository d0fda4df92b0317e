//! Market Data Feed Client
//!
//! Connects to the exchange WebSocket, subscribes to the configured
//! channels, and publishes each channel notification to the fan-out hub.
//!
//! # Protocol
//!
//! 1. Connect to `wss://{host}/ws/api/v2`
//! 2. Send `{"method":"public/subscribe","params":{"channels":[...]}}`
//! 3. Receive `{"method":"subscription","params":{"channel":"...","data":{...}}}`
//!
//! The topic of an update is the instrument segment of its channel and the
//! payload is the notification's `params` object, forwarded unparsed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::rpc::{
    ChannelParams, FeedFrame, RpcRequest, SUBSCRIBE_METHOD, SUBSCRIPTION_NOTIFICATION, TEST_METHOD,
    topic_of_channel,
};
use crate::application::ports::UpdateSink;
use crate::domain::streaming::TopicSequencer;
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::metrics::{record_feed_error, record_feed_message, record_feed_reconnect};

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const HEARTBEAT_NOTIFICATION: &str = "heartbeat";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the feed client.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The exchange refused the channel subscription.
    #[error("subscription rejected ({code}): {message}")]
    SubscriptionRejected {
        /// Exchange error code.
        code: i64,
        /// Exchange error message.
        message: String,
    },

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FeedClientError {
    const fn label(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Malformed(_) => "malformed",
            Self::SubscriptionRejected { .. } => "subscription_rejected",
            Self::MaxReconnectAttemptsExceeded => "max_reconnects",
            Self::ConnectionClosed => "closed",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Channels to subscribe to.
    pub channels: Vec<String>,
    /// Interval between keepalive pings.
    pub heartbeat_interval: Duration,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
}

impl FeedClientConfig {
    /// Build from the feed URL and settings.
    #[must_use]
    pub fn from_settings(url: String, settings: &FeedSettings) -> Self {
        Self {
            url,
            channels: settings.channels.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            reconnect: ReconnectConfig::from_feed_settings(settings),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Connection state of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Connecting or subscribing.
    #[default]
    Connecting,
    /// Subscribed and receiving.
    Connected,
    /// Waiting before the next attempt.
    Reconnecting,
    /// Stopped by cancellation or after giving up.
    Stopped,
}

/// Feed status for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedStatus {
    /// Connection state.
    pub state: FeedState,
    /// Channel notifications received since start.
    pub messages_received: u64,
    /// Reconnection attempts since start.
    pub reconnects: u64,
    /// Most recent error.
    pub last_error: Option<String>,
}

// =============================================================================
// Feed Client
// =============================================================================

/// Market data feed client.
///
/// Manages the connection lifecycle including:
/// - Channel subscription
/// - Keepalive pings
/// - Automatic reconnection with exponential backoff
pub struct FeedClient {
    config: FeedClientConfig,
    sink: Arc<dyn UpdateSink>,
    sequencer: TopicSequencer,
    cancel: CancellationToken,
    status: RwLock<FeedStatus>,
}

impl FeedClient {
    /// Create a new feed client.
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        sink: Arc<dyn UpdateSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sink,
            sequencer: TopicSequencer::new(),
            cancel,
            status: RwLock::new(FeedStatus::default()),
        }
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        self.status.read().clone()
    }

    /// Run the connection loop until cancelled or attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns `MaxReconnectAttemptsExceeded` once the reconnect policy
    /// gives up.
    pub async fn run(self: Arc<Self>) -> Result<(), FeedClientError> {
        let mut reconnect_policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(FeedState::Stopped);
                tracing::info!("Feed client cancelled");
                return Ok(());
            }

            self.set_state(FeedState::Connecting);

            match self.connect_and_run(&mut reconnect_policy).await {
                Ok(()) => {
                    self.set_state(FeedState::Stopped);
                    tracing::info!("Feed connection closed gracefully");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    record_feed_error(e.label());
                    self.status.write().last_error = Some(e.to_string());

                    let Some(delay) = reconnect_policy.next_delay() else {
                        self.set_state(FeedState::Stopped);
                        return Err(FeedClientError::MaxReconnectAttemptsExceeded);
                    };

                    let attempt = reconnect_policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to market data feed"
                    );
                    record_feed_reconnect();
                    {
                        let mut status = self.status.write();
                        status.state = FeedState::Reconnecting;
                        status.reconnects += 1;
                    }

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.set_state(FeedState::Stopped);
                            tracing::info!("Feed client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_run(
        &self,
        reconnect_policy: &mut ReconnectPolicy,
    ) -> Result<(), FeedClientError> {
        tracing::info!(url = %self.config.url, "Connecting to market data feed");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = RpcRequest::new(
            SUBSCRIBE_REQUEST_ID,
            SUBSCRIBE_METHOD,
            json!({ "channels": self.config.channels }),
        );
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?.into()))
            .await?;
        tracing::debug!(channels = ?self.config.channels, "Sent channel subscription");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    write.send(Message::Ping(Bytes::new())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.handle_text(&text) {
                                Ok(FrameAction::None) => {}
                                Ok(FrameAction::Subscribed) => {
                                    reconnect_policy.reset();
                                    self.set_state(FeedState::Connected);
                                }
                                Ok(FrameAction::Reply(reply)) => {
                                    write.send(Message::Text(reply.into())).await?;
                                }
                                Err(e @ FeedClientError::SubscriptionRejected { .. }) => {
                                    return Err(e);
                                }
                                Err(e) => {
                                    record_feed_error(e.label());
                                    tracing::warn!(error = %e, "Dropping feed frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Pong and binary frames
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Feed stream ended");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Process one text frame, publishing channel data to the sink.
    fn handle_text(&self, text: &str) -> Result<FrameAction, FeedClientError> {
        let frame: FeedFrame<'_> = serde_json::from_str(text)?;

        match frame.method {
            Some(SUBSCRIPTION_NOTIFICATION) => {
                let Some(params) = frame.params else {
                    return Ok(FrameAction::None);
                };
                let channel: ChannelParams = serde_json::from_str(params.get())?;
                let topic = topic_of_channel(&channel.channel);
                let update = self
                    .sequencer
                    .stamp(topic, Bytes::copy_from_slice(params.get().as_bytes()));

                record_feed_message();
                self.status.write().messages_received += 1;

                let report = self.sink.publish(update);
                tracing::trace!(topic, delivered = report.delivered, "Published update");
                Ok(FrameAction::None)
            }
            Some(HEARTBEAT_NOTIFICATION) => {
                let reply = RpcRequest::new(0, TEST_METHOD, json!({}));
                Ok(FrameAction::Reply(serde_json::to_string(&reply)?))
            }
            Some(other) => {
                tracing::trace!(method = other, "Ignoring notification");
                Ok(FrameAction::None)
            }
            None if frame.id == Some(SUBSCRIBE_REQUEST_ID) => {
                if let Some(error) = frame.error {
                    return Err(FeedClientError::SubscriptionRejected {
                        code: error.code,
                        message: error.message,
                    });
                }
                tracing::info!(
                    channels = frame.result.map(|r| r.get()),
                    "Feed channels subscribed"
                );
                Ok(FrameAction::Subscribed)
            }
            None => {
                if let Some(error) = frame.error {
                    tracing::warn!(code = error.code, message = %error.message, "Feed error response");
                }
                Ok(FrameAction::None)
            }
        }
    }

    fn set_state(&self, state: FeedState) {
        self.status.write().state = state;
    }
}

/// What the connection loop does after a text frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    None,
    Subscribed,
    Reply(String),
}
