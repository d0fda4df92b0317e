//! Port Interfaces
//!
//! Contracts between the core and its collaborators, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Authenticator`: exchanges client credentials for an access token
//! - `Transport`: sends an authenticated command and returns the raw response
//!
//! ## Driver Ports (Inbound)
//!
//! - `UpdateSink`: the single injection point for market data updates

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::command::CommandRequest;
use crate::domain::session::AccessToken;
use crate::domain::streaming::Update;

// =============================================================================
// Credentials
// =============================================================================

/// Exchange API client credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }

    /// Client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Authenticator
// =============================================================================

/// A freshly issued token and its lifetime.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Bearer token.
    pub access_token: AccessToken,
    /// Lifetime from the moment of issue.
    pub expires_in: Duration,
}

/// Why authentication failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    /// Exchange refused the credentials.
    #[error("credentials rejected ({code}): {message}")]
    Rejected {
        /// Exchange error code.
        code: i64,
        /// Exchange error message.
        message: String,
    },

    /// Request never produced a usable response.
    #[error("authentication transport error: {0}")]
    Transport(String),

    /// Response could not be parsed.
    #[error("malformed authentication response: {0}")]
    Malformed(String),
}

/// Exchanges credentials for an access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a new access token.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Grant, AuthFailure>;
}

// =============================================================================
// Transport
// =============================================================================

/// A command ready to go on the wire.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    /// Correlation id (JSON-RPC `id`).
    pub id: u64,
    /// The command.
    pub request: CommandRequest,
    /// Bearer token, absent for public calls.
    pub token: Option<AccessToken>,
}

/// Unparsed exchange response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl RawResponse {
    /// Create a new raw response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Connection-level transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No response within the deadline.
    #[error("request timed out")]
    Timeout,

    /// The request could not be delivered or the response not read.
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Sends commands to the exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the raw response.
    async fn call(&self, request: &AuthenticatedRequest) -> Result<RawResponse, TransportError>;
}

// =============================================================================
// Update Sink
// =============================================================================

/// Result of handing one update to the fan-out layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the update was queued for.
    pub delivered: usize,
    /// Older updates evicted to make room.
    pub evicted: usize,
    /// Connections that refused the update as out of order.
    pub stale: usize,
}

/// Receives market data updates from the feed.
pub trait UpdateSink: Send + Sync {
    /// Fan `update` out to matching subscribers without blocking on I/O.
    fn publish(&self, update: Update) -> PublishReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new("client".to_string(), "secret456".to_string());
        let debug = format!("{creds:?}");
        assert!(debug.contains("client"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn auth_failure_display() {
        let failure = AuthFailure::Rejected {
            code: 13004,
            message: "invalid_credentials".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "credentials rejected (13004): invalid_credentials"
        );
    }
}
