//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (authenticator, transport, update sink).
pub mod ports;

/// Application services for session management and command execution.
pub mod services;
