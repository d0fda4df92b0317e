//! Admin HTTP Server
//!
//! Health checks, Prometheus metrics, and the command submission endpoint.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of the session, feed, and hub
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (session valid and hub listening)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /v1/commands` - Execute a `CommandRequest`, returns a `CommandResult`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{CommandExecutor, SessionStatus};
use crate::domain::command::{CommandRequest, CommandResult, ErrorKind};
use crate::domain::session::SessionState;
use crate::infrastructure::deribit::{FeedClient, FeedState, FeedStatus};
use crate::infrastructure::hub::{FanOutHub, HubStats};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Exchange session.
    pub session: SessionStatus,
    /// Upstream market data feed.
    pub feed: FeedStatus,
    /// Local subscribers.
    pub hub: HubStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Session valid, feed connected, hub listening.
    Healthy,
    /// Hub listening but the session or the feed is not up.
    Degraded,
    /// Hub not accepting subscribers.
    Unhealthy,
}

// =============================================================================
// Admin Server State
// =============================================================================

/// Shared state for the admin server.
pub struct AdminState {
    version: String,
    started_at: Instant,
    executor: Arc<CommandExecutor>,
    hub: Arc<FanOutHub>,
    feed: Arc<FeedClient>,
}

impl AdminState {
    /// Create new admin server state.
    #[must_use]
    pub fn new(
        version: String,
        executor: Arc<CommandExecutor>,
        hub: Arc<FanOutHub>,
        feed: Arc<FeedClient>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            executor,
            hub,
            feed,
        }
    }
}

// =============================================================================
// Admin Server
// =============================================================================

/// Admin HTTP server.
pub struct AdminServer {
    port: u16,
    state: Arc<AdminState>,
    cancel: CancellationToken,
}

impl AdminServer {
    /// Create a new admin server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AdminState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the admin server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AdminServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), AdminServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AdminServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Admin server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| AdminServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Admin server stopped");
        Ok(())
    }
}

/// Build the admin router.
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/commands", post(command_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let session_valid = state.executor.sessions().state() == SessionState::Valid;

    if session_valid && state.hub.is_listening() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn command_handler(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let result = state.executor.execute(request).await;
    (command_status(&result), Json(result))
}

const fn command_status(result: &CommandResult) -> StatusCode {
    if result.success {
        return StatusCode::OK;
    }
    match result.error_kind {
        Some(ErrorKind::Rejected) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::Auth | ErrorKind::Protocol | ErrorKind::Transport) => {
            StatusCode::BAD_GATEWAY
        }
        Some(ErrorKind::Config) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn build_health_response(state: &AdminState) -> HealthResponse {
    let session = state.executor.sessions().status();
    let feed = state.feed.status();
    let hub = state.hub.stats();

    HealthResponse {
        status: determine_health_status(session.state, feed.state, hub.listening),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        session,
        feed,
        hub,
    }
}

fn determine_health_status(
    session: SessionState,
    feed: FeedState,
    hub_listening: bool,
) -> HealthStatus {
    if !hub_listening {
        return HealthStatus::Unhealthy;
    }
    if session == SessionState::Valid && feed == FeedState::Connected {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Admin server errors.
#[derive(Debug, thiserror::Error)]
pub enum AdminServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
