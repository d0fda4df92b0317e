#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Deribit Gateway - Session Management and Topic Fan-Out
//!
//! Holds a single perishable Deribit access token on behalf of every
//! caller, executes trading commands over JSON-RPC with one bounded retry
//! on token rejection, and fans market data from one upstream WebSocket
//! feed out to many local WebSocket subscribers by topic.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Pure types
//!   - `session`: Access token, session lifetime and state
//!   - `subscription`: Sharded topic/connection registry
//!   - `streaming`: Sequenced updates
//!   - `command`: Trading intents and their results
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Authenticator, Transport, and UpdateSink
//!   - `services`: SessionManager (single-flight refresh), CommandExecutor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `deribit`: HTTP authenticator and transport, market data feed client
//!   - `hub`: Per-connection queues, fan-out, subscriber WebSocket server
//!   - `admin`: Health, metrics, and command submission over HTTP
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                              +-----------+   queue   +----------+
//! Deribit WS --> FeedClient -->| FanOutHub |---------->| writer 1 |--> Client 1
//!                 (sequencer)  | (registry)|---------->| writer N |--> Client N
//!                              +-----------+           +----------+
//!
//! POST /v1/commands --> CommandExecutor --> SessionManager --> Authenticator
//!                              |
//!                              +--> Transport --> Deribit JSON-RPC
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::command::{CommandKind, CommandRequest, CommandResult, ErrorKind, OrderType, Side};
pub use domain::session::{AccessToken, Session, SessionState};
pub use domain::streaming::{TopicSequencer, Update};
pub use domain::subscription::{ConnectionId, RegistryStats, SubscriptionRegistry, Topic};

// Ports and services
pub use application::ports::{
    AuthFailure, AuthenticatedRequest, Authenticator, Credentials, Grant, PublishReport,
    RawResponse, Transport, TransportError, UpdateSink,
};
pub use application::services::{
    CommandExecutor, SessionConfig, SessionError, SessionManager, SessionStatus,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Environment, GatewayConfig};

// Adapters
pub use infrastructure::deribit::{
    FeedClient, FeedClientConfig, FeedClientError, HttpAuthenticator, HttpTransport,
    build_http_client,
};

// Fan-out hub
pub use infrastructure::hub::{FanOutHub, HubConfig, HubError, HubStats};

// Admin server
pub use infrastructure::admin::{AdminServer, AdminServerError, AdminState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
