//! Domain Layer - Core session, subscription, and command types.
//!
//! Pure types with no I/O. Everything here is usable from synchronous
//! code and from tests without a running exchange.

/// Trading command requests and classified results.
pub mod command;

/// Access token and session lifecycle types.
pub mod session;

/// Market data update and per-topic sequencing.
pub mod streaming;

/// Sharded topic ↔ connection registry.
pub mod subscription;
