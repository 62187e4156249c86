use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::in_flight::InFlightState;
use super::tracker::LoginFailureTracker;
use super::{Authenticator, SessionEvent, SessionToken, TokenUse};
use crate::error::{GatewayError, LoginError, VaultError};
use crate::login::LoginReport;
use crate::vault::CredentialVault;

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct SessionState {
    current: Option<SessionToken>,
    generation: u64,
    in_flight: Option<Arc<InFlightState>>,
    /// Bumped by logout; logins started in an older epoch are discarded.
    epoch: u64,
    /// Identifier of the last successful login, used to key failures.
    identity: Option<String>,
}

const UNKNOWN_IDENTITY: &str = "unknown";

/// Owner of the current session token.
///
/// The state lock is never held across an await.
pub struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    vault: Arc<CredentialVault>,
    state: Mutex<SessionState>,
    token_tx: watch::Sender<Option<SessionToken>>,
    events: broadcast::Sender<SessionEvent>,
    failures: LoginFailureTracker,
}

/// Finishes the in-flight login with `Cancelled` if the leader's future is
/// dropped before completing it.
struct LeaderGuard<'a> {
    manager: &'a SessionManager,
    flight: Arc<InFlightState>,
    armed: bool,
}

impl LeaderGuard<'_> {
    fn complete(
        mut self,
        result: Result<LoginReport, LoginError>,
    ) -> Result<SessionToken, LoginError> {
        self.armed = false;
        self.manager.finish(&self.flight, result)
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Login leader dropped, releasing in-flight slot");
            let _ = self.manager.finish(&self.flight, Err(LoginError::Cancelled));
        }
    }
}

fn gateway_error(err: LoginError) -> GatewayError {
    match err {
        LoginError::Cancelled => GatewayError::Cancelled,
        other => GatewayError::Login(other),
    }
}

impl SessionManager {
    pub fn new(authenticator: Arc<dyn Authenticator>, vault: Arc<CredentialVault>) -> Self {
        let (token_tx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            authenticator,
            vault,
            state: Mutex::new(SessionState::default()),
            token_tx,
            events,
            failures: LoginFailureTracker::new(),
        }
    }

    pub fn current(&self) -> Option<SessionToken> {
        self.state.lock().current.clone()
    }

    /// Generation of the most recently issued token, `0` before the first login.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Token replacements, `None` when the token is dropped.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionToken>> {
        self.token_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn failure_tracker(&self) -> &LoginFailureTracker {
        &self.failures
    }

    fn emit(&self, event: SessionEvent) {
        debug!(event = event.event_name(), "{}", event.to_message());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// The current token, logging in first when there is none.
    ///
    /// Concurrent callers share one login. When the leader is cancelled its
    /// waiters elect a new leader instead of failing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SessionToken, LoginError> {
        loop {
            if cancel.is_cancelled() {
                return Err(LoginError::Cancelled);
            }

            let (flight, leader) = {
                let mut state = self.state.lock();
                if let Some(token) = &state.current {
                    return Ok(token.clone());
                }
                match &state.in_flight {
                    Some(flight) => (Arc::clone(flight), false),
                    None => {
                        let flight = Arc::new(InFlightState::new(state.epoch));
                        state.in_flight = Some(Arc::clone(&flight));
                        (flight, true)
                    }
                }
            };

            if leader {
                match self.lead(flight, cancel).await {
                    // discarded by a logout, not by our own cancellation
                    Err(LoginError::Cancelled) if !cancel.is_cancelled() => continue,
                    other => return other,
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LoginError::Cancelled),
                result = flight.wait() => result,
            };
            match result {
                Err(LoginError::Cancelled) => {
                    debug!("Login leader was cancelled, electing a new one");
                }
                other => return other,
            }
        }
    }

    async fn lead(
        &self,
        flight: Arc<InFlightState>,
        cancel: &CancellationToken,
    ) -> Result<SessionToken, LoginError> {
        let guard = LeaderGuard {
            manager: self,
            flight: Arc::clone(&flight),
            armed: true,
        };
        self.emit(SessionEvent::LoginStarted {
            timestamp: Utc::now(),
        });

        // The slot stays taken until the authenticator has returned, so an
        // aborted login never overlaps with the next one.
        let login_cancel = cancel.child_token();
        let login = self.authenticator.authenticate(&login_cancel);
        tokio::pin!(login);
        let result = tokio::select! {
            result = &mut login => result,
            _ = flight.aborted() => {
                debug!("Login aborted by logout, waiting for it to stop");
                login_cancel.cancel();
                login.await
            }
        };
        guard.complete(result)
    }

    fn finish(
        &self,
        flight: &Arc<InFlightState>,
        result: Result<LoginReport, LoginError>,
    ) -> Result<SessionToken, LoginError> {
        let (outcome, identity) = {
            let mut state = self.state.lock();
            if state
                .in_flight
                .as_ref()
                .is_some_and(|f| Arc::ptr_eq(f, flight))
            {
                state.in_flight = None;
            }

            let outcome = match result {
                Ok(_) if flight.epoch != state.epoch || flight.is_aborted() => {
                    debug!("Discarding login that finished after logout");
                    Err(LoginError::Cancelled)
                }
                Ok(report) => {
                    state.generation += 1;
                    let token = SessionToken {
                        value: report.token.clone(),
                        obtained_at: Utc::now(),
                        source_identifier: report.identifier.clone(),
                        generation: state.generation,
                    };
                    state.current = Some(token.clone());
                    state.identity = Some(report.identifier.clone());
                    Ok((token, report))
                }
                Err(e) => Err(e),
            };
            let identity = state
                .identity
                .clone()
                .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
            (outcome, identity)
        };

        let shared = match outcome {
            Ok((token, report)) => {
                self.token_tx.send_replace(Some(token.clone()));
                self.failures.clear(&report.identifier);
                self.failures.clear(UNKNOWN_IDENTITY);
                info!(generation = token.generation, "Session token replaced");
                self.emit(SessionEvent::LoggedIn {
                    identifier: report.identifier,
                    generation: token.generation,
                    try_count: report.try_count,
                    captcha_attempts: report.captcha_attempts,
                    timestamp: Utc::now(),
                });
                Ok(token)
            }
            Err(LoginError::Cancelled) => Err(LoginError::Cancelled),
            Err(e) => {
                let failure_count = self.failures.record_failure(&identity, &e.to_string());
                warn!(error = %e, failure_count, "Login failed");
                self.emit(SessionEvent::LoginFailed {
                    error: e.to_string(),
                    requires_reentry: e.requires_reentry(),
                    failure_count,
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        };

        flight.set_result(shared.clone());
        shared
    }

    /// Drop `token` if it is still the current one.
    ///
    /// Returns `false` when the token was already replaced, so a late rejection
    /// of an old token never discards a fresh one.
    pub fn invalidate(&self, token: &SessionToken) -> bool {
        {
            let mut state = self.state.lock();
            match &state.current {
                Some(current) if current.value == token.value => state.current = None,
                _ => return false,
            }
        }
        self.token_tx.send_replace(None);
        self.emit(SessionEvent::TokenInvalidated {
            generation: token.generation,
            timestamp: Utc::now(),
        });
        true
    }

    /// Run `action` with a valid token.
    pub async fn with_token<T, F, Fut>(&self, action: F) -> Result<T, GatewayError>
    where
        F: Fn(SessionToken) -> Fut,
        Fut: Future<Output = TokenUse<T>>,
    {
        self.with_token_cancellable(action, &CancellationToken::new())
            .await
    }

    /// Run `action` with a valid token, refreshing once if it is rejected.
    ///
    /// A second rejection right after a refresh is reported as
    /// [`GatewayError::SessionExpired`]; the action is never run a third time.
    #[instrument(skip_all)]
    pub async fn with_token_cancellable<T, F, Fut>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<T, GatewayError>
    where
        F: Fn(SessionToken) -> Fut,
        Fut: Future<Output = TokenUse<T>>,
    {
        let token = self.acquire(cancel).await.map_err(gateway_error)?;
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            used = action(token.clone()) => used,
        };
        match first {
            TokenUse::Done(value) => return Ok(value),
            TokenUse::Failed(e) => return Err(e),
            TokenUse::Rejected => {
                info!(generation = token.generation, "Session token rejected, refreshing");
                self.invalidate(&token);
            }
        }

        let fresh = self.acquire(cancel).await.map_err(gateway_error)?;
        let second = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            used = action(fresh.clone()) => used,
        };
        match second {
            TokenUse::Done(value) => Ok(value),
            TokenUse::Failed(e) => Err(e),
            TokenUse::Rejected => {
                warn!(generation = fresh.generation, "Refreshed token rejected as well");
                self.invalidate(&fresh);
                self.emit(SessionEvent::SessionExpired {
                    generation: fresh.generation,
                    timestamp: Utc::now(),
                });
                Err(GatewayError::SessionExpired)
            }
        }
    }

    /// Drop the token and the stored credential.
    ///
    /// A login still running is aborted. It keeps the in-flight slot until it
    /// has stopped, so callers arriving after the logout wait for it and then
    /// start a fresh login.
    pub async fn logout(&self) -> Result<(), VaultError> {
        {
            let mut state = self.state.lock();
            state.current = None;
            state.epoch += 1;
            if let Some(flight) = &state.in_flight {
                flight.abort();
            }
        }
        self.token_tx.send_replace(None);
        self.failures.clear_all();
        self.vault.clear().await?;
        self.emit(SessionEvent::LoggedOut {
            timestamp: Utc::now(),
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::testing::{CountingAuthenticator, manager};
    use super::*;

    fn auth(ms: u64) -> Arc<CountingAuthenticator> {
        Arc::new(CountingAuthenticator::new(Duration::from_millis(ms)))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let auth = auth(30);
        let manager = manager(auth.clone());

        let results = join_all((0..16).map(|_| {
            manager.with_token(|token| async move { TokenUse::Done(token.value) })
        }))
        .await;

        assert_eq!(auth.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), "tok-1");
        }
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn one_rejection_refreshes_once() {
        let auth = auth(1);
        let manager = manager(auth.clone());

        let value = manager
            .with_token(|token| async move {
                if token.value == "tok-1" {
                    TokenUse::Rejected
                } else {
                    TokenUse::Done(token.generation)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn two_rejections_expire_without_third_attempt() {
        let auth = auth(1);
        let manager = manager(auth.clone());
        let attempts = AtomicU32::new(0);

        let err = manager
            .with_token(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { TokenUse::<()>::Rejected }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::SessionExpired));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn stale_invalidation_keeps_fresh_token() {
        let manager = manager(auth(1));
        let cancel = CancellationToken::new();

        let first = manager.acquire(&cancel).await.unwrap();
        assert!(manager.invalidate(&first));
        let second = manager.acquire(&cancel).await.unwrap();
        assert!(second.generation > first.generation);

        assert!(!manager.invalidate(&first));
        assert_eq!(manager.current(), Some(second));
    }

    #[tokio::test]
    async fn waiters_elect_new_leader_when_leader_cancelled() {
        let auth = auth(50);
        let manager = Arc::new(manager(auth.clone()));

        let leader_cancel = CancellationToken::new();
        let leader = {
            let manager = manager.clone();
            let cancel = leader_cancel.clone();
            tokio::spawn(async move { manager.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader_cancel.cancel();

        assert_eq!(leader.await.unwrap(), Err(LoginError::Cancelled));
        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.value, "tok-2");
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn dropped_leader_releases_slot() {
        let auth = auth(200);
        let manager = manager(auth.clone());
        let cancel = CancellationToken::new();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), manager.acquire(&cancel)).await;
        assert!(timed_out.is_err());

        let token = tokio::time::timeout(Duration::from_secs(2), manager.acquire(&cancel))
            .await
            .expect("slot was not released")
            .unwrap();
        assert_eq!(token.value, "tok-2");
    }

    #[tokio::test]
    async fn failures_are_shared_and_tracked() {
        let auth = Arc::new(
            CountingAuthenticator::new(Duration::from_millis(20))
                .failing_first([LoginError::CaptchaUnsolvable { attempts: 6 }]),
        );
        let manager = manager(auth.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(manager.acquire(&cancel), manager.acquire(&cancel));
        assert_eq!(a, Err(LoginError::CaptchaUnsolvable { attempts: 6 }));
        assert_eq!(b, Err(LoginError::CaptchaUnsolvable { attempts: 6 }));
        assert_eq!(auth.calls(), 1);
        assert_eq!(manager.failure_tracker().failure_count(UNKNOWN_IDENTITY), 1);

        manager.acquire(&cancel).await.unwrap();
        assert_eq!(manager.failure_tracker().failure_count(UNKNOWN_IDENTITY), 0);
    }

    #[tokio::test]
    async fn replacement_is_published() {
        let manager = manager(auth(1));
        let mut tokens = manager.subscribe();
        let mut events = manager.events();

        let token = manager.acquire(&CancellationToken::new()).await.unwrap();
        tokens.changed().await.unwrap();
        assert_eq!(tokens.borrow().as_ref(), Some(&token));

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::LoginStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedIn { generation: 1, .. }
        ));
    }

    #[tokio::test]
    async fn logout_clears_token_and_vault() {
        let vault = Arc::new(CredentialVault::in_memory());
        vault.store("110000000", "secret").await.unwrap();
        let manager = SessionManager::new(auth(1), vault.clone());

        manager.acquire(&CancellationToken::new()).await.unwrap();
        manager.logout().await.unwrap();

        assert!(manager.current().is_none());
        assert!(vault.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_finishing_after_logout_is_discarded() {
        let auth = auth(50);
        let manager = Arc::new(manager(auth.clone()));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_token(|t| async move { TokenUse::Done(t) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout().await.unwrap();

        // the discarded login makes the caller log in again
        let token = pending.await.unwrap().unwrap();
        assert_eq!(token.value, "tok-2");
        assert_eq!(manager.generation(), 1);
    }

    /// Tracks how many logins are running at once.
    struct OverlapAuthenticator {
        running: AtomicU32,
        peak: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Authenticator for OverlapAuthenticator {
        async fn authenticate(
            &self,
            cancel: &CancellationToken,
        ) -> Result<LoginReport, LoginError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(LoginError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(LoginReport {
                    identifier: "110000000".to_string(),
                    token: format!("tok-{n}"),
                    try_count: 1,
                    captcha_attempts: 1,
                }),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn logout_never_overlaps_two_logins() {
        let auth = Arc::new(OverlapAuthenticator {
            running: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let manager = Arc::new(SessionManager::new(
            auth.clone(),
            Arc::new(CredentialVault::in_memory()),
        ));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout().await.unwrap();

        let token = manager.acquire(&CancellationToken::new()).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), token);

        assert_eq!(auth.peak.load(Ordering::SeqCst), 1);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
        assert_eq!(token.value, "tok-2");
    }
}
