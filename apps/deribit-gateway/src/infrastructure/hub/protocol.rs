//! Subscriber Wire Protocol
//!
//! JSON text frames exchanged with local subscribers.
//!
//! # Client Frames
//!
//! ```json
//! {"action":"subscribe","topics":["BTC-PERPETUAL"]}
//! {"action":"unsubscribe","topics":["BTC-PERPETUAL"]}
//! {"action":"ping"}
//! ```
//!
//! # Server Frames
//!
//! ```json
//! {"type":"subscribed","topics":["BTC-PERPETUAL"]}
//! {"type":"unsubscribed","topics":["BTC-PERPETUAL"]}
//! {"type":"pong"}
//! {"type":"error","message":"..."}
//! {"type":"update","topic":"BTC-PERPETUAL","sequence":1,"payload":{...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::domain::streaming::Update;
use crate::domain::subscription::Topic;

/// Errors decoding a client frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or an unknown action.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Subscribe or unsubscribe without topics.
    #[error("topic list is empty")]
    EmptyTopics,

    /// A topic is empty or whitespace.
    #[error("topic must not be blank")]
    BlankTopic,

    /// A binary frame was received.
    #[error("binary frames are not supported")]
    Binary,
}

/// Decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Add topics.
    Subscribe {
        /// Topics to add.
        topics: Vec<Topic>,
    },
    /// Remove topics.
    Unsubscribe {
        /// Topics to remove.
        topics: Vec<Topic>,
    },
    /// Liveness check.
    Ping,
}

impl ClientMessage {
    /// Decode and validate a text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing why the frame was refused.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;

        match &message {
            Self::Subscribe { topics } | Self::Unsubscribe { topics } => {
                if topics.is_empty() {
                    return Err(ProtocolError::EmptyTopics);
                }
                if topics.iter().any(|t| t.trim().is_empty()) {
                    return Err(ProtocolError::BlankTopic);
                }
            }
            Self::Ping => {}
        }

        Ok(message)
    }
}

/// Control frame sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Topics now held.
    Subscribed {
        /// Topics named in the request.
        topics: Vec<Topic>,
    },
    /// Topics released.
    Unsubscribed {
        /// Topics named in the request.
        topics: Vec<Topic>,
    },
    /// Reply to `ping`.
    Pong,
    /// The last client frame was refused.
    Error {
        /// Reason.
        message: String,
    },
}

impl ServerFrame {
    /// Encode as a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"encode"}"#.to_string())
    }
}

#[derive(Serialize)]
struct UpdateFrame<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'a str,
    sequence: u64,
    payload: P,
}

/// Encode an update as a JSON text frame.
///
/// JSON payloads are embedded as-is; anything else is sent as a string.
#[must_use]
pub fn encode_update(update: &Update) -> String {
    let payload = update.payload();
    let encoded = match serde_json::from_slice::<&RawValue>(payload) {
        Ok(raw) => serde_json::to_string(&UpdateFrame {
            kind: "update",
            topic: update.topic(),
            sequence: update.sequence(),
            payload: raw,
        }),
        Err(_) => serde_json::to_string(&UpdateFrame {
            kind: "update",
            topic: update.topic(),
            sequence: update.sequence(),
            payload: String::from_utf8_lossy(payload),
        }),
    };
    encoded.unwrap_or_default()
}
