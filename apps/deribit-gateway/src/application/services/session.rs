//! Session Manager
//!
//! Owns the process-wide access token. Callers get a token through
//! [`SessionManager::ensure_valid`]; when the token is missing or expired
//! the first caller starts a refresh and every concurrent caller awaits
//! that same refresh, so at most one authentication request is ever in
//! flight.
//!
//! The refresh runs on its own task. A caller that gives up waiting does
//! not cancel it; the refresh still completes (or times out) and its
//! result is visible to the next caller.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::application::ports::{AuthFailure, Authenticator, Credentials};
use crate::domain::session::{Session, SessionState};
use crate::infrastructure::metrics::{RefreshOutcome, record_session_refresh};

/// Default time allowed for one token refresh.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default margin before expiry at which a token is treated as expired.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

// =============================================================================
// Error Type
// =============================================================================

/// Why a session could not be established.
///
/// Cloneable because every caller that joined a refresh receives the same
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The authenticator reported a failure.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    /// The authenticator did not answer in time.
    #[error("token refresh timed out after {0:?}")]
    Timeout(Duration),

    /// The refresh task ended without producing a result.
    #[error("token refresh aborted")]
    Aborted,
}

// =============================================================================
// Configuration
// =============================================================================

/// Session manager tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time allowed for one refresh before it counts as failed.
    pub refresh_timeout: Duration,
    /// Tokens this close to expiry are refreshed before use.
    pub refresh_margin: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time view of the session for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// Refresh generation of the held token (0 before the first refresh).
    pub generation: u64,
    /// Seconds until the held token expires.
    pub expires_in_secs: Option<u64>,
}

// =============================================================================
// Session Manager
// =============================================================================

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, SessionError>>>;

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    state: SessionState,
    in_flight: Option<RefreshFuture>,
    generation: u64,
    attempts: u64,
}

/// Owner of the single process-wide session.
pub struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    credentials: Credentials,
    config: SessionConfig,
    slot: Arc<Mutex<SessionSlot>>,
}

impl SessionManager {
    /// Create a manager with no session yet.
    #[must_use]
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Self {
        Self {
            authenticator,
            credentials,
            config,
            slot: Arc::new(Mutex::new(SessionSlot::default())),
        }
    }

    /// Return a session that is not expired at call time.
    ///
    /// Refreshes when there is no session or the held one is within the
    /// refresh margin of expiry. Joins a refresh that is already running
    /// instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns the refresh failure. Every caller that joined the same
    /// refresh receives the same error; no retry is attempted here.
    pub async fn ensure_valid(&self) -> Result<Session, SessionError> {
        let refresh = {
            let mut slot = self.slot.lock();

            if let Some(session) = slot.session.as_ref() {
                if !session.is_expired_at(Instant::now(), self.config.refresh_margin) {
                    return Ok(session.clone());
                }
                tracing::debug!(generation = session.generation(), "Access token expired");
            }

            match slot.in_flight.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => self.start_refresh(&mut slot),
            }
        };

        refresh.await
    }

    /// Drop the held token so the next `ensure_valid` refreshes.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        if let Some(session) = slot.session.take() {
            tracing::info!(generation = session.generation(), "Session invalidated");
        }
        if slot.in_flight.is_none() {
            slot.state = SessionState::Expired;
        }
    }

    /// Drop the held token only if it is still generation `generation`.
    ///
    /// Returns whether the token was dropped. A caller holding a token that
    /// has already been replaced leaves the newer one alone.
    pub fn invalidate_if_current(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        let is_current = slot
            .session
            .as_ref()
            .is_some_and(|session| session.generation() == generation);

        if is_current {
            slot.session = None;
            if slot.in_flight.is_none() {
                slot.state = SessionState::Expired;
            }
            tracing::info!(generation, "Session invalidated after token rejection");
        }

        is_current
    }

    /// Current lifecycle state.
    ///
    /// A held token that has run out reports `Expired` even before the next
    /// `ensure_valid` notices it.
    #[must_use]
    pub fn state(&self) -> SessionState {
        let slot = self.slot.lock();
        self.observed_state(&slot, Instant::now())
    }

    /// Snapshot for health output.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let slot = self.slot.lock();
        let now = Instant::now();
        SessionStatus {
            state: self.observed_state(&slot, now),
            generation: slot.generation,
            expires_in_secs: slot
                .session
                .as_ref()
                .map(|session| session.remaining(now).as_secs()),
        }
    }

    /// The held session, if any, without refreshing.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.slot.lock().session.clone()
    }

    fn observed_state(&self, slot: &SessionSlot, now: Instant) -> SessionState {
        match (slot.state, slot.session.as_ref()) {
            (SessionState::Valid, Some(session))
                if session.is_expired_at(now, self.config.refresh_margin) =>
            {
                SessionState::Expired
            }
            (state, _) => state,
        }
    }

    fn start_refresh(&self, slot: &mut SessionSlot) -> RefreshFuture {
        let authenticator = Arc::clone(&self.authenticator);
        let credentials = self.credentials.clone();
        let shared_slot = Arc::clone(&self.slot);
        let timeout = self.config.refresh_timeout;

        tracing::info!("Refreshing access token");

        // The spawned task cannot observe the slot until the caller's guard
        // is released, so `in_flight` is always set before it is cleared.
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(timeout, authenticator.authenticate(&credentials)).await
                {
                    Ok(Ok(grant)) => Ok(grant),
                    Ok(Err(failure)) => Err(SessionError::Auth(failure)),
                    Err(_) => Err(SessionError::Timeout(timeout)),
                };
            let elapsed = started.elapsed();

            let mut slot = shared_slot.lock();
            slot.in_flight = None;

            let generation = slot.generation + 1;
            let outcome = outcome.and_then(|grant| {
                let ttl = grant.expires_in;
                Session::new(grant.access_token, Instant::now(), ttl, generation).ok_or_else(|| {
                    SessionError::Auth(AuthFailure::Malformed(format!(
                        "token lifetime out of range: {}s",
                        ttl.as_secs()
                    )))
                })
            });

            match outcome {
                Ok(session) => {
                    slot.generation = generation;
                    slot.session = Some(session.clone());
                    slot.state = SessionState::Valid;
                    record_session_refresh(RefreshOutcome::Success, elapsed);
                    tracing::info!(
                        generation,
                        expires_in_secs = session.remaining(Instant::now()).as_secs(),
                        "Access token refreshed"
                    );
                    Ok(session)
                }
                Err(e) => {
                    slot.session = None;
                    slot.state = SessionState::Expired;
                    let outcome = if matches!(e, SessionError::Timeout(_)) {
                        RefreshOutcome::Timeout
                    } else {
                        RefreshOutcome::Failure
                    };
                    record_session_refresh(outcome, elapsed);
                    tracing::warn!(error = %e, "Access token refresh failed");
                    Err(e)
                }
            }
        });

        slot.attempts += 1;
        let attempt = slot.attempts;
        let abort_slot = Arc::clone(&self.slot);
        let refresh = async move {
            handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Token refresh task failed");
                // Only the latest attempt may reset the slot.
                let mut slot = abort_slot.lock();
                if slot.attempts == attempt && slot.state == SessionState::Refreshing {
                    slot.in_flight = None;
                    slot.state = SessionState::Expired;
                }
                Err(SessionError::Aborted)
            })
        }
        .boxed()
        .shared();

        slot.state = SessionState::Refreshing;
        slot.in_flight = Some(refresh.clone());
        refresh
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::{Grant, MockAuthenticator};
    use crate::domain::session::AccessToken;

    /// Authenticator that counts calls and answers after a delay.
    struct CountingAuthenticator {
        calls: AtomicUsize,
        delay: Duration,
        ttl: Duration,
        fail: bool,
    }

    impl CountingAuthenticator {
        fn new(delay: Duration, ttl: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                ttl,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::from_millis(50), Duration::from_secs(900))
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Grant, AuthFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AuthFailure::Rejected {
                    code: 13004,
                    message: "invalid_credentials".to_string(),
                });
            }
            Ok(Grant {
                access_token: AccessToken::new(format!("token-{n}")),
                expires_in: self.ttl,
            })
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("client".to_string(), "secret".to_string())
    }

    fn manager(authenticator: Arc<dyn Authenticator>, config: SessionConfig) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(authenticator, credentials(), config))
    }

    fn no_margin() -> SessionConfig {
        SessionConfig {
            refresh_margin: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(200),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth.clone(), no_margin());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move { sessions.ensure_valid().await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(auth.calls(), 1);
        assert!(results.iter().all(|s| s == &results[0]));
        assert_eq!(results[0].token().expose(), "token-1");
        assert_eq!(sessions.state(), SessionState::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let auth = Arc::new(CountingAuthenticator::failing());
        let sessions = manager(auth.clone(), no_margin());

        let (a, b, c) = tokio::join!(
            sessions.ensure_valid(),
            sessions.ensure_valid(),
            sessions.ensure_valid()
        );

        assert_eq!(auth.calls(), 1);
        let expected = SessionError::Auth(AuthFailure::Rejected {
            code: 13004,
            message: "invalid_credentials".to_string(),
        });
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(c.unwrap_err(), expected);
        assert_eq!(sessions.state(), SessionState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_session_is_reused() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth.clone(), no_margin());

        let first = sessions.ensure_valid().await.unwrap();
        let second = sessions.ensure_valid().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_triggers_one_refresh() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        let sessions = manager(auth.clone(), no_margin());

        let first = sessions.ensure_valid().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let (a, b) = tokio::join!(sessions.ensure_valid(), sessions.ensure_valid());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(auth.calls(), 2);
        assert_eq!(a, b);
        assert_eq!(a.generation(), first.generation() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_margin_refreshes_early() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        let config = SessionConfig {
            refresh_margin: Duration::from_secs(30),
            ..SessionConfig::default()
        };
        let sessions = manager(auth.clone(), config);

        sessions.ensure_valid().await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        sessions.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 1);

        tokio::time::advance(Duration::from_secs(15)).await;
        sessions.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_times_out() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_secs(60),
            Duration::from_secs(900),
        ));
        let config = SessionConfig {
            refresh_timeout: Duration::from_secs(5),
            refresh_margin: Duration::ZERO,
        };
        let sessions = manager(auth.clone(), config);

        let result = sessions.ensure_valid().await;

        assert_eq!(result.unwrap_err(), SessionError::Timeout(Duration::from_secs(5)));
        assert_eq!(sessions.state(), SessionState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refresh() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth.clone(), no_margin());

        sessions.ensure_valid().await.unwrap();
        sessions.invalidate();
        assert_eq!(sessions.state(), SessionState::Expired);
        assert!(sessions.current().is_none());

        let refreshed = sessions.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 2);
        assert_eq!(refreshed.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_invalidate_ignores_replaced_token() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth.clone(), no_margin());

        let old = sessions.ensure_valid().await.unwrap();
        assert!(sessions.invalidate_if_current(old.generation()));
        let new = sessions.ensure_valid().await.unwrap();

        assert!(!sessions.invalidate_if_current(old.generation()));
        assert_eq!(sessions.current(), Some(new));
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_retry_automatically() {
        let auth = Arc::new(CountingAuthenticator::failing());
        let sessions = manager(auth.clone(), no_margin());

        assert!(sessions.ensure_valid().await.is_err());
        assert_eq!(auth.calls(), 1);
        assert!(sessions.ensure_valid().await.is_err());
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_cancel_refresh() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(100),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth.clone(), no_margin());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), sessions.ensure_valid()).await;
        assert!(abandoned.is_err());
        assert_eq!(sessions.state(), SessionState::Refreshing);

        let session = sessions.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 1);
        assert_eq!(session.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_expiry() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(900),
        ));
        let sessions = manager(auth, no_margin());

        assert_eq!(sessions.status().state, SessionState::Unauthenticated);
        sessions.ensure_valid().await.unwrap();

        let status = sessions.status();
        assert_eq!(status.state, SessionState::Valid);
        assert_eq!(status.generation, 1);
        assert_eq!(status.expires_in_secs, Some(900));
    }

    #[tokio::test(start_paused = true)]
    async fn state_reports_expired_token() {
        let auth = Arc::new(CountingAuthenticator::new(
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        let sessions = manager(auth.clone(), no_margin());

        sessions.ensure_valid().await.unwrap();
        assert_eq!(sessions.state(), SessionState::Valid);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(sessions.state(), SessionState::Expired);
        let status = sessions.status();
        assert_eq!(status.state, SessionState::Expired);
        assert_eq!(status.expires_in_secs, Some(0));
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn oversized_token_lifetime_is_malformed() {
        let mut mock = MockAuthenticator::new();
        mock.expect_authenticate().times(1).returning(|_| {
            Ok(Grant {
                access_token: AccessToken::new("forever"),
                expires_in: Duration::from_secs(u64::MAX),
            })
        });
        let sessions = manager(Arc::new(mock), no_margin());

        let result = sessions.ensure_valid().await;

        assert!(matches!(
            result,
            Err(SessionError::Auth(AuthFailure::Malformed(_)))
        ));
        assert_eq!(sessions.state(), SessionState::Expired);
        assert!(sessions.current().is_none());
        assert_eq!(sessions.status().generation, 0);
    }

    /// Panics on the first call, succeeds afterwards.
    struct PanicOnceAuthenticator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for PanicOnceAuthenticator {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Grant, AuthFailure> {
            assert!(self.calls.fetch_add(1, Ordering::SeqCst) > 0, "authenticator blew up");
            Ok(Grant {
                access_token: AccessToken::new("recovered"),
                expires_in: Duration::from_secs(900),
            })
        }
    }

    #[tokio::test]
    async fn dead_refresh_task_does_not_wedge_session() {
        let sessions = manager(
            Arc::new(PanicOnceAuthenticator {
                calls: AtomicUsize::new(0),
            }),
            no_margin(),
        );

        assert_eq!(sessions.ensure_valid().await.unwrap_err(), SessionError::Aborted);
        assert_eq!(sessions.state(), SessionState::Expired);

        let session = sessions.ensure_valid().await.unwrap();
        assert_eq!(session.token().expose(), "recovered");
        assert_eq!(sessions.state(), SessionState::Valid);
    }

    #[tokio::test]
    async fn mock_authenticator_called_once() {
        let mut mock = MockAuthenticator::new();
        mock.expect_authenticate().times(1).returning(|_| {
            Ok(Grant {
                access_token: AccessToken::new("mocked"),
                expires_in: Duration::from_secs(900),
            })
        });
        let sessions = manager(Arc::new(mock), no_margin());

        let first = sessions.ensure_valid().await.unwrap();
        let second = sessions.ensure_valid().await.unwrap();

        assert_eq!(first.token().expose(), "mocked");
        assert_eq!(first, second);
    }
}
