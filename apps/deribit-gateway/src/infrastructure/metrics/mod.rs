//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Updates**: Published, delivered, evicted, and stale updates
//! - **Connections**: Local subscriber connections and active topics
//! - **Session**: Token refreshes by outcome and refresh latency
//! - **Commands**: Commands by kind and outcome, command latency
//! - **Feed**: Upstream messages, reconnects, and errors
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the admin server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::command::{CommandKind, ErrorKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call more than once; later calls return the installed handle.
/// Returns `None` if another global recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_metrics();
            Some(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Update counters
    describe_counter!(
        "deribit_gateway_updates_published_total",
        "Total updates handed to the fan-out hub"
    );
    describe_counter!(
        "deribit_gateway_updates_delivered_total",
        "Total updates queued for subscriber connections"
    );
    describe_counter!(
        "deribit_gateway_updates_dropped_total",
        "Total queued updates evicted by the drop-oldest policy"
    );
    describe_counter!(
        "deribit_gateway_updates_stale_total",
        "Total updates refused as older than the last queued for their topic"
    );

    // Connection gauges
    describe_gauge!(
        "deribit_gateway_client_connections",
        "Number of open subscriber connections"
    );
    describe_gauge!(
        "deribit_gateway_active_topics",
        "Number of topics with at least one subscriber"
    );

    // Session
    describe_counter!(
        "deribit_gateway_session_refreshes_total",
        "Total token refreshes by outcome"
    );
    describe_histogram!(
        "deribit_gateway_session_refresh_seconds",
        "Time spent obtaining a new access token"
    );

    // Commands
    describe_counter!(
        "deribit_gateway_commands_total",
        "Total commands executed by kind and outcome"
    );
    describe_histogram!(
        "deribit_gateway_command_duration_seconds",
        "End-to-end command execution time"
    );

    // Feed
    describe_counter!(
        "deribit_gateway_feed_messages_total",
        "Total market data notifications received from the exchange"
    );
    describe_counter!(
        "deribit_gateway_feed_reconnects_total",
        "Total market data feed reconnection attempts"
    );
    describe_counter!(
        "deribit_gateway_feed_errors_total",
        "Total market data feed errors by type"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a token refresh.
#[derive(Debug, Clone, Copy)]
pub enum RefreshOutcome {
    /// New token obtained.
    Success,
    /// Authenticator reported a failure.
    Failure,
    /// No answer within the refresh timeout.
    Timeout,
}

impl RefreshOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// Record updates handed to the hub and their fan-out results.
pub fn record_publish(delivered: usize, evicted: usize, stale: usize) {
    counter!("deribit_gateway_updates_published_total").increment(1);
    counter!("deribit_gateway_updates_delivered_total").increment(delivered as u64);
    if evicted > 0 {
        counter!("deribit_gateway_updates_dropped_total").increment(evicted as u64);
    }
    if stale > 0 {
        counter!("deribit_gateway_updates_stale_total").increment(stale as u64);
    }
}

/// Update the open connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_client_connections(count: usize) {
    gauge!("deribit_gateway_client_connections").set(count as f64);
}

/// Update the active topic count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_topics(count: usize) {
    gauge!("deribit_gateway_active_topics").set(count as f64);
}

/// Record a token refresh.
pub fn record_session_refresh(outcome: RefreshOutcome, duration: Duration) {
    counter!(
        "deribit_gateway_session_refreshes_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("deribit_gateway_session_refresh_seconds").record(duration.as_secs_f64());
}

/// Record an executed command.
///
/// `error` is `None` for successful commands.
pub fn record_command(kind: CommandKind, error: Option<ErrorKind>, duration: Duration) {
    let outcome = error.map_or("success", ErrorKind::as_str);
    counter!(
        "deribit_gateway_commands_total",
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "deribit_gateway_command_duration_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a notification received from the market data feed.
pub fn record_feed_message() {
    counter!("deribit_gateway_feed_messages_total").increment(1);
}

/// Record a market data feed reconnection attempt.
pub fn record_feed_reconnect() {
    counter!("deribit_gateway_feed_reconnects_total").increment(1);
}

/// Record a market data feed error.
pub fn record_feed_error(error_type: &'static str) {
    counter!(
        "deribit_gateway_feed_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_outcome_as_str() {
        assert_eq!(RefreshOutcome::Success.as_str(), "success");
        assert_eq!(RefreshOutcome::Failure.as_str(), "failure");
        assert_eq!(RefreshOutcome::Timeout.as_str(), "timeout");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_publish(3, 1, 0);
        record_command(CommandKind::Place, Some(ErrorKind::Auth), Duration::from_millis(5));
        record_session_refresh(RefreshOutcome::Success, Duration::from_millis(20));
        set_client_connections(2);
        set_active_topics(1);
    }
}
