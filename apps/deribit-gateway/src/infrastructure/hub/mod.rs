//! Fan-Out Hub
//!
//! Local subscriber side of the gateway: per-connection bounded queues,
//! connection lifecycle, the client wire protocol, and the WebSocket server.

pub mod connection;
pub mod fanout;
pub mod protocol;
pub mod queue;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionState};
pub use fanout::{FanOutHub, HubConfig, HubStats};
pub use protocol::{ClientMessage, ProtocolError, ServerFrame};
pub use queue::{OutboundQueue, PushOutcome};
pub use server::{HubError, bind, serve};
