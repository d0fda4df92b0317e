//! Trading Command Types
//!
//! Declarative requests the command executor serves and the classified
//! result it hands back. Requests are plain values: no identity beyond
//! their fields and no order ledger behind them.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default order book depth for `GetBook`.
pub const DEFAULT_BOOK_DEPTH: u32 = 10;

// =============================================================================
// Request
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl Side {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Order type for `Place`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order (requires a price).
    #[default]
    Limit,
    /// Market order.
    Market,
}

impl OrderType {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Limit => "limit",
            Self::Market => "market",
        }
    }
}

/// A trading intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandRequest {
    /// Place a new order.
    Place {
        /// Instrument name, e.g. `BTC-PERPETUAL`.
        instrument: String,
        /// Buy or sell.
        side: Side,
        /// Order amount.
        amount: Decimal,
        /// Limit price (required for limit orders).
        #[serde(default)]
        price: Option<Decimal>,
        /// Order type.
        #[serde(default)]
        order_type: OrderType,
    },
    /// Cancel an open order.
    Cancel {
        /// Exchange order id.
        order_id: String,
    },
    /// Change price (and optionally amount) of an open order.
    Modify {
        /// Exchange order id.
        order_id: String,
        /// New price.
        price: Decimal,
        /// New amount.
        #[serde(default)]
        amount: Option<Decimal>,
    },
    /// Fetch the order book of an instrument.
    GetBook {
        /// Instrument name.
        instrument: String,
        /// Levels per side.
        #[serde(default = "default_depth")]
        depth: u32,
    },
    /// Fetch open positions.
    GetPositions {
        /// Currency, e.g. `BTC`.
        currency: String,
        /// Instrument kind filter, e.g. `future`.
        #[serde(default)]
        instrument_kind: Option<String>,
    },
}

const fn default_depth() -> u32 {
    DEFAULT_BOOK_DEPTH
}

/// Request discriminant for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Place.
    Place,
    /// Cancel.
    Cancel,
    /// Modify.
    Modify,
    /// Order book query.
    GetBook,
    /// Positions query.
    GetPositions,
}

impl CommandKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Place => "place",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::GetBook => "get_book",
            Self::GetPositions => "get_positions",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CommandRequest {
    /// The request's kind.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Place { .. } => CommandKind::Place,
            Self::Cancel { .. } => CommandKind::Cancel,
            Self::Modify { .. } => CommandKind::Modify,
            Self::GetBook { .. } => CommandKind::GetBook,
            Self::GetPositions { .. } => CommandKind::GetPositions,
        }
    }

    /// Whether the call needs a bearer token.
    ///
    /// Order book queries are public.
    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        !matches!(self, Self::GetBook { .. })
    }
}

// =============================================================================
// Result
// =============================================================================

/// Classification of a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid local configuration.
    Config,
    /// Session could not be established, or the token was rejected again
    /// after the single retry.
    Auth,
    /// No response within the request timeout.
    Timeout,
    /// Empty or unparseable response.
    Protocol,
    /// Connection-level failure.
    Transport,
    /// Exchange rejected the request on business grounds.
    Rejected,
}

impl ErrorKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Transport => "transport",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the exchange accepted the request.
    pub success: bool,
    /// HTTP status of the last response, if one arrived.
    pub remote_status: Option<u16>,
    /// Classification when `success` is false.
    pub error_kind: Option<ErrorKind>,
    /// Exchange error code, if the exchange supplied one.
    pub error_code: Option<i64>,
    /// Human-readable failure detail.
    pub message: Option<String>,
    /// The exchange's `result` payload on success.
    pub result: Option<serde_json::Value>,
}

impl CommandResult {
    /// Successful result.
    #[must_use]
    pub const fn success(remote_status: u16, result: serde_json::Value) -> Self {
        Self {
            success: true,
            remote_status: Some(remote_status),
            error_kind: None,
            error_code: None,
            message: None,
            result: Some(result),
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            remote_status: None,
            error_kind: Some(kind),
            error_code: None,
            message: Some(message.into()),
            result: None,
        }
    }

    /// Attach the HTTP status.
    #[must_use]
    pub const fn with_remote_status(mut self, status: u16) -> Self {
        self.remote_status = Some(status);
        self
    }

    /// Attach the exchange error code.
    #[must_use]
    pub const fn with_error_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }
}
