//! HTTP Authenticator
//!
//! Obtains access tokens with the `client_credentials` grant.
//!
//! # Flow
//!
//! 1. `POST {base}/api/v2/public/auth` with a JSON-RPC body carrying
//!    `grant_type`, `client_id`, and `client_secret`
//! 2. Receive `{"result":{"access_token":"...","expires_in":900,...}}`
//!    or `{"error":{"code":13004,"message":"invalid_credentials"}}`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::rpc::{AUTH_METHOD, AuthResult, RpcRequest, RpcResponse};
use crate::application::ports::{AuthFailure, Authenticator, Credentials, Grant};
use crate::domain::session::AccessToken;

/// Authenticator backed by the exchange's HTTP API.
#[derive(Debug)]
pub struct HttpAuthenticator {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpAuthenticator {
    /// Create an authenticator for the API at `base_url`.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/v2/{AUTH_METHOD}", base_url.trim_end_matches('/')),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Grant, AuthFailure> {
        let request = RpcRequest::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            AUTH_METHOD,
            json!({
                "grant_type": "client_credentials",
                "client_id": credentials.client_id(),
                "client_secret": credentials.client_secret(),
            }),
        );

        tracing::debug!(client_id = credentials.client_id(), "Requesting access token");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthFailure::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthFailure::Transport(e.to_string()))?;

        let parsed: RpcResponse<AuthResult> = serde_json::from_str(&body)
            .map_err(|e| AuthFailure::Malformed(format!("HTTP {status}: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(AuthFailure::Rejected {
                code: error.code,
                message: error.message,
            });
        }

        let result = parsed
            .result
            .ok_or_else(|| AuthFailure::Malformed(format!("HTTP {status}: missing result")))?;

        if result.access_token.is_empty() {
            return Err(AuthFailure::Malformed("empty access token".to_string()));
        }

        Ok(Grant {
            access_token: AccessToken::new(result.access_token),
            expires_in: Duration::from_secs(result.expires_in),
        })
    }
}
