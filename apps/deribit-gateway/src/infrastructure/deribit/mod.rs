//! Deribit Adapters
//!
//! Concrete collaborators for the exchange: JSON-RPC wire types, the HTTP
//! authenticator and transport, and the market data feed client.

use std::time::Duration;

pub mod auth;
pub mod feed;
pub mod reconnect;
pub mod rpc;
pub mod transport;

pub use auth::HttpAuthenticator;
pub use feed::{FeedClient, FeedClientConfig, FeedClientError, FeedState, FeedStatus};
pub use transport::HttpTransport;

/// Build the HTTP client shared by the authenticator and the transport.
///
/// `timeout` bounds each request end to end.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("deribit-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
}
