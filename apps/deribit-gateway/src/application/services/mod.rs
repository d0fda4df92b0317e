//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SessionManager`: Owns the access token and serializes refreshes
//! - `CommandExecutor`: Sends authenticated commands and classifies results

/// Command execution with single retry on token rejection.
pub mod executor;

/// Single-flight access token management.
pub mod session;

pub use executor::CommandExecutor;
pub use session::{SessionConfig, SessionError, SessionManager, SessionStatus};
