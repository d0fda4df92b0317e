//! Command Executor
//!
//! Turns a [`CommandRequest`] into an authenticated exchange call and
//! classifies the outcome. A call rejected for an invalid or expired token
//! invalidates the session and is retried exactly once with a fresh token;
//! nothing else is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::session::SessionManager;
use crate::application::ports::{AuthenticatedRequest, RawResponse, Transport, TransportError};
use crate::domain::command::{CommandRequest, CommandResult, ErrorKind};
use crate::infrastructure::metrics::record_command;

/// Default per-call timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Exchange error code for a missing or invalid bearer token.
pub const UNAUTHORIZED_CODE: i64 = 13009;

/// Exchange error code for rejected credentials.
pub const INVALID_CREDENTIALS_CODE: i64 = 13004;

const HTTP_UNAUTHORIZED: u16 = 401;

// =============================================================================
// Response Classification
// =============================================================================

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

/// What a raw response means for the executor.
#[derive(Debug, Clone, PartialEq)]
enum Classified {
    /// Exchange accepted the request.
    Accepted(serde_json::Value),
    /// The bearer token was refused.
    TokenRejected { code: Option<i64>, message: String },
    /// Terminal failure.
    Failed(CommandResult),
}

const fn is_token_rejection(code: i64) -> bool {
    matches!(code, UNAUTHORIZED_CODE | INVALID_CREDENTIALS_CODE)
}

fn classify(response: &RawResponse, bearer: bool) -> Classified {
    let status = response.status;
    let body = response.body.trim();

    if bearer && status == HTTP_UNAUTHORIZED {
        let error = serde_json::from_str::<ResponseEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error);
        return Classified::TokenRejected {
            code: error.as_ref().map(|e| e.code),
            message: error.map_or_else(|| "unauthorized".to_string(), |e| e.message),
        };
    }

    if body.is_empty() {
        return Classified::Failed(
            CommandResult::failure(ErrorKind::Protocol, "empty response body")
                .with_remote_status(status),
        );
    }

    let envelope: ResponseEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Classified::Failed(
                CommandResult::failure(ErrorKind::Protocol, format!("malformed response: {e}"))
                    .with_remote_status(status),
            );
        }
    };

    match (envelope.error, envelope.result) {
        (Some(error), _) if bearer && is_token_rejection(error.code) => {
            Classified::TokenRejected {
                code: Some(error.code),
                message: error.message,
            }
        }
        (Some(error), _) => Classified::Failed(
            CommandResult::failure(ErrorKind::Rejected, error.message)
                .with_remote_status(status)
                .with_error_code(error.code),
        ),
        (None, Some(result)) if (200..300).contains(&status) => Classified::Accepted(result),
        (None, Some(_)) => Classified::Failed(
            CommandResult::failure(
                ErrorKind::Protocol,
                format!("result returned with HTTP status {status}"),
            )
            .with_remote_status(status),
        ),
        (None, None) => Classified::Failed(
            CommandResult::failure(ErrorKind::Protocol, "response has neither result nor error")
                .with_remote_status(status),
        ),
    }
}

// =============================================================================
// Command Executor
// =============================================================================

/// Executes trading commands against the exchange.
pub struct CommandExecutor {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl CommandExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            transport,
            request_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// The session manager serving this executor.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Execute `request` and classify the outcome.
    ///
    /// Never panics and never retries more than once.
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind()))]
    pub async fn execute(&self, request: CommandRequest) -> CommandResult {
        let started = Instant::now();
        let kind = request.kind();

        let result = self.run(&request).await;

        record_command(kind, result.error_kind, started.elapsed());
        if let Some(error_kind) = result.error_kind {
            tracing::warn!(
                %error_kind,
                remote_status = ?result.remote_status,
                error_code = ?result.error_code,
                message = ?result.message,
                "Command failed"
            );
        } else {
            tracing::info!(remote_status = ?result.remote_status, "Command succeeded");
        }

        result
    }

    async fn run(&self, request: &CommandRequest) -> CommandResult {
        let mut retried = false;

        loop {
            let session = if request.requires_auth() {
                match self.sessions.ensure_valid().await {
                    Ok(session) => Some(session),
                    Err(e) => return CommandResult::failure(ErrorKind::Auth, e.to_string()),
                }
            } else {
                None
            };

            let call = AuthenticatedRequest {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                request: request.clone(),
                token: session.as_ref().map(|s| s.token().clone()),
            };

            let response = match self.send(&call).await {
                Ok(response) => response,
                Err(result) => return result,
            };

            match classify(&response, session.is_some()) {
                Classified::Accepted(value) => {
                    return CommandResult::success(response.status, value);
                }
                Classified::Failed(result) => return result,
                Classified::TokenRejected { code, message } => {
                    if retried {
                        let mut result = CommandResult::failure(
                            ErrorKind::Auth,
                            format!("token rejected after refresh: {message}"),
                        )
                        .with_remote_status(response.status);
                        if let Some(code) = code {
                            result = result.with_error_code(code);
                        }
                        return result;
                    }

                    if let Some(session) = session {
                        tracing::info!(
                            generation = session.generation(),
                            ?code,
                            "Token rejected, refreshing and retrying once"
                        );
                        self.sessions.invalidate_if_current(session.generation());
                    }
                    retried = true;
                }
            }
        }
    }

    async fn send(&self, call: &AuthenticatedRequest) -> Result<RawResponse, CommandResult> {
        match tokio::time::timeout(self.request_timeout, self.transport.call(call)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(TransportError::Timeout)) | Err(_) => Err(CommandResult::failure(
                ErrorKind::Timeout,
                format!("no response within {:?}", self.request_timeout),
            )),
            Ok(Err(TransportError::Connection(message))) => {
                Err(CommandResult::failure(ErrorKind::Transport, message))
            }
        }
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;
    use crate::application::ports::{
        AuthFailure, Authenticator, Credentials, Grant, MockTransport,
    };
    use crate::application::services::session::SessionConfig;
    use crate::domain::command::Side;
    use crate::domain::session::AccessToken;

    // -------------------------------------------------------------------------
    // Fakes
    // -------------------------------------------------------------------------

    struct FakeAuthenticator {
        calls: AtomicUsize,
        ttl: Duration,
        fail: bool,
    }

    impl FakeAuthenticator {
        fn new(ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl: Duration::from_secs(900),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Grant, AuthFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthFailure::Transport("connection refused".to_string()));
            }
            Ok(Grant {
                access_token: AccessToken::new(format!("token-{n}")),
                expires_in: self.ttl,
            })
        }
    }

    /// Transport that replays scripted responses and records the tokens it saw.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        tokens: Mutex<Vec<Option<String>>>,
        delay: Option<Duration>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Self::delayed(vec![], delay)
        }

        fn delayed(script: Vec<Result<RawResponse, TransportError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay: Some(delay),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.tokens.lock().len()
        }

        fn tokens(&self) -> Vec<Option<String>> {
            self.tokens.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, request: &AuthenticatedRequest) -> Result<RawResponse, TransportError> {
            self.tokens
                .lock()
                .push(request.token.as_ref().map(|t| t.expose().to_string()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_response()))
        }
    }

    fn ok_response() -> RawResponse {
        RawResponse::new(200, r#"{"jsonrpc":"2.0","id":1,"result":{"order":{"order_id":"1"}}}"#)
    }

    fn unauthorized_response() -> RawResponse {
        RawResponse::new(
            400,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":13009,"message":"unauthorized"}}"#,
        )
    }

    fn place() -> CommandRequest {
        CommandRequest::Place {
            instrument: "BTC-PERPETUAL".to_string(),
            side: Side::Buy,
            amount: Decimal::from(10),
            price: Some(Decimal::from(50_000)),
            order_type: crate::domain::command::OrderType::Limit,
        }
    }

    fn positions() -> CommandRequest {
        CommandRequest::GetPositions {
            currency: "BTC".to_string(),
            instrument_kind: None,
        }
    }

    fn sessions(auth: Arc<dyn Authenticator>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            auth,
            Credentials::new("client".to_string(), "secret".to_string()),
            SessionConfig {
                refresh_margin: Duration::ZERO,
                ..SessionConfig::default()
            },
        ))
    }

    fn executor(sessions: Arc<SessionManager>, transport: Arc<dyn Transport>) -> CommandExecutor {
        CommandExecutor::new(sessions, transport, DEFAULT_REQUEST_TIMEOUT)
    }

    // -------------------------------------------------------------------------
    // Classification
    // -------------------------------------------------------------------------

    #[test_case(200, "" ; "empty body")]
    #[test_case(200, "   " ; "blank body")]
    #[test_case(200, "<html>bad gateway</html>" ; "html body")]
    #[test_case(200, r#"{"jsonrpc":"2.0","id":1}"# ; "neither result nor error")]
    #[test_case(502, r#"{"result":{}}"# ; "result with error status")]
    fn classify_protocol_errors(status: u16, body: &str) {
        let classified = classify(&RawResponse::new(status, body), true);
        let Classified::Failed(result) = classified else {
            panic!("expected failure, got {classified:?}");
        };
        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));
        assert_eq!(result.remote_status, Some(status));
    }

    #[test_case(13009, true, true ; "unauthorized on bearer call")]
    #[test_case(13004, true, true ; "invalid credentials on bearer call")]
    #[test_case(13009, false, false ; "unauthorized on public call")]
    #[test_case(10009, true, false ; "not enough funds")]
    #[test_case(11044, true, false ; "not open order")]
    fn classify_error_codes(code: i64, bearer: bool, token_rejected: bool) {
        let body = format!(r#"{{"jsonrpc":"2.0","id":7,"error":{{"code":{code},"message":"m"}}}}"#);
        let classified = classify(&RawResponse::new(400, body), bearer);

        if token_rejected {
            assert_eq!(
                classified,
                Classified::TokenRejected {
                    code: Some(code),
                    message: "m".to_string()
                }
            );
        } else {
            let Classified::Failed(result) = classified else {
                panic!("expected failure, got {classified:?}");
            };
            assert_eq!(result.error_kind, Some(ErrorKind::Rejected));
            assert_eq!(result.error_code, Some(code));
        }
    }

    #[test]
    fn classify_http_unauthorized_without_body() {
        let classified = classify(&RawResponse::new(401, ""), true);
        assert_eq!(
            classified,
            Classified::TokenRejected {
                code: None,
                message: "unauthorized".to_string()
            }
        );
    }

    #[test]
    fn classify_success() {
        let classified = classify(&ok_response(), true);
        assert!(matches!(classified, Classified::Accepted(v) if v["order"]["order_id"] == "1"));
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn successful_place() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![Ok(ok_response())]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let result = exec.execute(place()).await;

        assert!(result.success);
        assert_eq!(result.remote_status, Some(200));
        assert_eq!(transport.tokens(), vec![Some("token-1".to_string())]);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn stale_token_retries_exactly_once() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport =
            ScriptedTransport::new(vec![Ok(unauthorized_response()), Ok(ok_response())]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let result = exec.execute(place()).await;

        assert!(result.success);
        assert_eq!(transport.calls(), 2);
        assert_eq!(
            transport.tokens(),
            vec![Some("token-1".to_string()), Some("token-2".to_string())]
        );
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn second_rejection_surfaces_auth_error() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![
            Ok(unauthorized_response()),
            Ok(unauthorized_response()),
            Ok(ok_response()),
        ]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let result = exec.execute(place()).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Auth));
        assert_eq!(result.error_code, Some(UNAUTHORIZED_CODE));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn business_rejection_is_not_retried() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![Ok(RawResponse::new(
            400,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":10009,"message":"not_enough_funds"}}"#,
        ))]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let result = exec.execute(place()).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Rejected));
        assert_eq!(result.error_code, Some(10009));
        assert_eq!(result.message.as_deref(), Some("not_enough_funds"));
        assert_eq!(transport.calls(), 1);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connection(
            "connection reset".to_string(),
        ))]);
        let exec = executor(sessions(auth), transport.clone());

        let result = exec.execute(place()).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Transport));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn empty_response_is_protocol_error() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![Ok(RawResponse::new(200, ""))]);
        let exec = executor(sessions(auth), transport.clone());

        let result = exec.execute(place()).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::slow(Duration::from_secs(30));
        let exec = CommandExecutor::new(sessions(auth), transport.clone(), Duration::from_secs(10));

        let result = exec.execute(place()).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_failure_is_auth_error_without_transport_call() {
        let auth = FakeAuthenticator::failing();
        let transport = ScriptedTransport::new(vec![]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let first = exec.execute(positions()).await;
        let second = exec.execute(positions()).await;

        assert_eq!(first.error_kind, Some(ErrorKind::Auth));
        assert_eq!(second.error_kind, Some(ErrorKind::Auth));
        assert_eq!(auth.calls(), 2);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_refreshes_once_before_query() {
        let auth = FakeAuthenticator::new(Duration::from_secs(60));
        let transport = ScriptedTransport::new(vec![]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        assert!(exec.execute(positions()).await.success);
        tokio::time::advance(Duration::from_secs(61)).await;

        let result = exec.execute(positions()).await;

        assert!(result.success);
        assert_eq!(auth.calls(), 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn public_book_query_skips_session() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::new(vec![]);
        let exec = executor(sessions(auth.clone()), transport.clone());

        let result = exec
            .execute(CommandRequest::GetBook {
                instrument: "BTC-PERPETUAL".to_string(),
                depth: 10,
            })
            .await;

        assert!(result.success);
        assert_eq!(auth.calls(), 0);
        assert_eq!(transport.tokens(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_rejections_share_one_refresh() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let transport = ScriptedTransport::delayed(
            vec![Ok(unauthorized_response()), Ok(unauthorized_response())],
            Duration::from_millis(100),
        );
        let sessions = sessions(auth.clone());
        sessions.ensure_valid().await.unwrap();
        let exec = Arc::new(executor(sessions, transport.clone()));

        let (a, b) = tokio::join!(exec.execute(place()), exec.execute(place()));

        assert!(a.success);
        assert!(b.success);
        assert_eq!(auth.calls(), 2);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn mock_transport_sees_one_retry() {
        let auth = FakeAuthenticator::new(Duration::from_secs(900));
        let mut mock = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_call()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RawResponse::new(401, "")));
        mock.expect_call()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok_response()));
        let exec = executor(sessions(auth), Arc::new(mock));

        let result = exec.execute(positions()).await;

        assert!(result.success);
    }
}
