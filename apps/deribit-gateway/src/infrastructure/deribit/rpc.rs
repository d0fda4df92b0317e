//! JSON-RPC Wire Types
//!
//! Request envelope, response envelope, and the mapping from trading
//! commands to exchange methods.
//!
//! # Methods
//!
//! | Command        | Method                                    |
//! |----------------|-------------------------------------------|
//! | `Place`        | `private/buy` or `private/sell`           |
//! | `Cancel`       | `private/cancel`                          |
//! | `Modify`       | `private/edit`                            |
//! | `GetBook`      | `public/get_order_book`                   |
//! | `GetPositions` | `private/get_positions`                   |

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value, json};

use crate::domain::command::{CommandRequest, OrderType, Side};

/// JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Authentication method.
pub const AUTH_METHOD: &str = "public/auth";

/// Channel subscription method.
pub const SUBSCRIBE_METHOD: &str = "public/subscribe";

/// Keepalive method.
pub const TEST_METHOD: &str = "public/test";

/// Notification method for channel data.
pub const SUBSCRIPTION_NOTIFICATION: &str = "subscription";

// =============================================================================
// Envelopes
// =============================================================================

/// Outgoing JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id.
    pub id: u64,
    /// Method name, e.g. `private/buy`.
    pub method: &'static str,
    /// Method parameters.
    pub params: Value,
}

impl RpcRequest {
    /// Build a request.
    #[must_use]
    pub const fn new(id: u64, method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }

    /// Build the request for a trading command.
    #[must_use]
    pub fn for_command(id: u64, request: &CommandRequest) -> Self {
        let call = MethodCall::from_command(request);
        Self::new(id, call.method, call.params)
    }
}

/// Error member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    /// Exchange error code.
    pub code: i64,
    /// Exchange error message.
    #[serde(default)]
    pub message: String,
    /// Optional detail.
    #[serde(default)]
    pub data: Option<Value>,
}

/// Incoming JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    /// Correlation id of the request.
    #[serde(default)]
    pub id: Option<u64>,
    /// Result on success.
    pub result: Option<T>,
    /// Error on failure.
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// `public/auth` result.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Token for `refresh_token` grants.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Any frame received on the market data WebSocket.
///
/// Responses carry `id`; notifications carry `method` and `params`.
#[derive(Debug, Deserialize)]
pub struct FeedFrame<'a> {
    /// Correlation id for responses.
    #[serde(default)]
    pub id: Option<u64>,
    /// Notification method.
    #[serde(default, borrow)]
    pub method: Option<&'a str>,
    /// Notification params, kept unparsed.
    #[serde(default, borrow)]
    pub params: Option<&'a RawValue>,
    /// Response result, kept unparsed.
    #[serde(default, borrow)]
    pub result: Option<&'a RawValue>,
    /// Response error.
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// The channel name inside a `subscription` notification.
#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    /// Channel, e.g. `book.BTC-PERPETUAL.100ms`.
    pub channel: String,
}

/// Topic key for a channel: its instrument segment.
///
/// `book.BTC-PERPETUAL.100ms` maps to `BTC-PERPETUAL`; a channel without
/// a second segment maps to itself.
#[must_use]
pub fn topic_of_channel(channel: &str) -> &str {
    let mut parts = channel.split('.');
    let _kind = parts.next();
    match parts.next() {
        Some(instrument) if !instrument.is_empty() => instrument,
        _ => channel,
    }
}

// =============================================================================
// Command Mapping
// =============================================================================

/// Method name and parameters for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Method name.
    pub method: &'static str,
    /// Method parameters.
    pub params: Value,
}

impl MethodCall {
    /// Map a trading command to its exchange method.
    #[must_use]
    pub fn from_command(request: &CommandRequest) -> Self {
        match request {
            CommandRequest::Place {
                instrument,
                side,
                amount,
                price,
                order_type,
            } => {
                let method = match side {
                    Side::Buy => "private/buy",
                    Side::Sell => "private/sell",
                };
                let mut params = Map::new();
                params.insert("instrument_name".into(), json!(instrument));
                params.insert("amount".into(), decimal(*amount));
                params.insert("type".into(), json!(order_type.as_str()));
                if let (OrderType::Limit, Some(price)) = (order_type, price) {
                    params.insert("price".into(), decimal(*price));
                }
                Self {
                    method,
                    params: Value::Object(params),
                }
            }
            CommandRequest::Cancel { order_id } => Self {
                method: "private/cancel",
                params: json!({ "order_id": order_id }),
            },
            CommandRequest::Modify {
                order_id,
                price,
                amount,
            } => {
                let mut params = Map::new();
                params.insert("order_id".into(), json!(order_id));
                params.insert("price".into(), decimal(*price));
                if let Some(amount) = amount {
                    params.insert("amount".into(), decimal(*amount));
                }
                Self {
                    method: "private/edit",
                    params: Value::Object(params),
                }
            }
            CommandRequest::GetBook { instrument, depth } => Self {
                method: "public/get_order_book",
                params: json!({ "instrument_name": instrument, "depth": depth }),
            },
            CommandRequest::GetPositions {
                currency,
                instrument_kind,
            } => {
                let mut params = Map::new();
                params.insert("currency".into(), json!(currency));
                if let Some(kind) = instrument_kind {
                    params.insert("kind".into(), json!(kind));
                }
                Self {
                    method: "private/get_positions",
                    params: Value::Object(params),
                }
            }
        }
    }
}

/// Exchange APIs take numeric amounts and prices.
///
/// A value goes out as a JSON number only when the `f64` reads back as the
/// same decimal; anything else is sent as its exact decimal string.
fn decimal(value: Decimal) -> Value {
    value
        .to_f64()
        .filter(|v| v.to_string().parse::<Decimal>().is_ok_and(|back| back == value))
        .map_or_else(|| Value::String(value.normalize().to_string()), |v| json!(v))
}
