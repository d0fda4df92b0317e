//! Session Types
//!
//! The access token, its lifetime, and the lifecycle state the session
//! manager moves it through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

// =============================================================================
// Access Token
// =============================================================================

/// Opaque bearer token issued by the exchange.
///
/// `Debug` and `Display` never print the token itself.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    /// Wrap a raw token string.
    #[must_use]
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// Raw token for the `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of the process-wide session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No token has been obtained yet.
    #[default]
    Unauthenticated,
    /// A token is held and not expired.
    Valid,
    /// A refresh is in flight.
    Refreshing,
    /// The token expired, was invalidated, or the last refresh failed.
    Expired,
}

impl SessionState {
    /// Lowercase name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Valid => "valid",
            Self::Refreshing => "refreshing",
            Self::Expired => "expired",
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A token together with its validity window.
///
/// `generation` increases by one on every successful refresh, which lets
/// callers tell whether the session they hold is still the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: AccessToken,
    issued_at: Instant,
    expires_at: Instant,
    generation: u64,
}

impl Session {
    /// Create a session issued at `issued_at` and living for `ttl`.
    ///
    /// Returns `None` when `ttl` puts the expiry outside the representable
    /// range of [`Instant`].
    #[must_use]
    pub fn new(
        token: AccessToken,
        issued_at: Instant,
        ttl: Duration,
        generation: u64,
    ) -> Option<Self> {
        let expires_at = issued_at.checked_add(ttl)?;
        Some(Self {
            token,
            issued_at,
            expires_at,
            generation,
        })
    }

    /// Bearer token.
    #[must_use]
    pub const fn token(&self) -> &AccessToken {
        &self.token
    }

    /// When the token was issued.
    #[must_use]
    pub const fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// When the token stops being accepted.
    #[must_use]
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Refresh generation that produced this session.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the token should be treated as expired at `now`.
    ///
    /// A token within `margin` of its expiry counts as expired.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant, margin: Duration) -> bool {
        now.checked_add(margin)
            .is_none_or(|deadline| deadline >= self.expires_at)
    }

    /// Time left until expiry (zero once expired).
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
