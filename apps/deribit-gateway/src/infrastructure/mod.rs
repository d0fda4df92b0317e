//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the servers hosting them.

/// Admin HTTP endpoint (health, metrics, command submission).
pub mod admin;

/// Configuration loading.
pub mod config;

/// Deribit JSON-RPC and market data adapters.
pub mod deribit;

/// Local subscriber fan-out over WebSocket.
pub mod hub;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
