//! HTTP Transport
//!
//! Sends trading commands as JSON-RPC `POST {base}/api/v2/{method}` with a
//! bearer token for private methods. Responses are returned unparsed; the
//! command executor classifies them.

use async_trait::async_trait;
use reqwest::Client;

use super::rpc::RpcRequest;
use crate::application::ports::{AuthenticatedRequest, RawResponse, Transport, TransportError};

/// Transport backed by the exchange's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the API at `base_url`.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/api/v2/{method}", self.base_url)
    }
}

fn transport_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: &AuthenticatedRequest) -> Result<RawResponse, TransportError> {
        let rpc = RpcRequest::for_command(request.id, &request.request);
        let url = self.url(rpc.method);

        tracing::debug!(id = rpc.id, method = rpc.method, "Sending command");

        let mut builder = self.client.post(&url).json(&rpc);
        if let Some(token) = &request.token {
            builder = builder.bearer_auth(token.expose());
        }

        let response = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| transport_error(&e))?;

        Ok(RawResponse { status, body })
    }
}
