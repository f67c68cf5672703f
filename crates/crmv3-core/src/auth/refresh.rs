//! Single-flight refresh of the access token.
//!
//! The first caller that finds no exchange in flight moves the state machine
//! to `RefreshingInPlace` and spawns the exchange. Everyone arriving while it
//! runs is queued and performs no network call. When the exchange settles the
//! queue is taken out of its slot in one step, which also clears the
//! "in flight" marker, and every waiter gets the same outcome in arrival
//! order. A caller arriving after that step starts a new exchange.
//!
//! The exchange runs on its own task: dropping a waiter (or the caller that
//! started it) never cancels it. The only bound is the configured timeout,
//! which settles the exchange as a failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialPair};
use super::error::RefreshError;
use super::state::{AuthStateMachine, RefreshTicket, SessionState};
use super::token::{BearerToken, TokenCodec};
use crate::api::AuthBackend;

type RefreshOutcome = Result<Credential, RefreshError>;
type Waiter = oneshot::Sender<RefreshOutcome>;

/// `Some` while an exchange is in flight.
type WaiterQueue = Option<VecDeque<Waiter>>;

#[derive(Clone)]
pub struct RefreshCoordinator {
    machine: Arc<AuthStateMachine>,
    backend: Arc<dyn AuthBackend>,
    timeout: Duration,
    queue: Arc<Mutex<WaiterQueue>>,
    exchanges: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    pub fn new(machine: Arc<AuthStateMachine>, backend: Arc<dyn AuthBackend>, timeout: Duration) -> Self {
        Self {
            machine,
            backend,
            timeout,
            queue: Arc::new(Mutex::new(None)),
            exchanges: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaiterQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().is_some()
    }

    /// Number of exchanges started by this coordinator.
    pub fn exchanges_started(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Obtain a new access credential, joining the in-flight exchange if
    /// there is one.
    pub async fn ensure_fresh_credential(&self) -> Result<Credential, RefreshError> {
        let rx = {
            let mut queue = self.lock();
            self.enqueue(&mut queue)
        };
        rx.await.unwrap_or(Err(RefreshError::Superseded))
    }

    /// Like [`Self::ensure_fresh_credential`], but for a caller whose request
    /// was rejected with `rejected`. If a newer, locally valid token has
    /// already been committed it is returned without another exchange.
    pub async fn ensure_fresh_credential_after(
        &self,
        rejected: &BearerToken,
    ) -> Result<Credential, RefreshError> {
        let rx = {
            let mut queue = self.lock();
            if queue.is_none() {
                if let SessionState::Authenticated(session) = self.machine.peek() {
                    let current = &session.credentials.access_token;
                    if current != rejected && !TokenCodec::is_expired(current.expose_secret(), Utc::now()) {
                        debug!("Newer access token already committed, skipping refresh");
                        return Ok(session.credentials.credential());
                    }
                }
            }
            self.enqueue(&mut queue)
        };
        rx.await.unwrap_or(Err(RefreshError::Superseded))
    }

    fn enqueue(&self, queue: &mut WaiterQueue) -> oneshot::Receiver<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        match queue.as_mut() {
            Some(waiters) => {
                waiters.push_back(tx);
                debug!(queued = waiters.len(), "Joined in-flight refresh");
            }
            None => {
                let started = self.machine.begin_refresh();
                *queue = Some(VecDeque::from([tx]));
                self.exchanges.fetch_add(1, Ordering::Relaxed);

                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.run_exchange(started).await;
                });
            }
        }
        rx
    }

    async fn run_exchange(self, started: Option<(RefreshTicket, CredentialPair)>) {
        let mut guard = SettleGuard {
            coordinator: self.clone(),
            ticket: started.as_ref().map(|(ticket, _)| *ticket),
            settled: false,
        };

        let outcome = match started {
            None => {
                debug!("Refresh requested without an authenticated session");
                Err(RefreshError::NoRefreshToken)
            }
            Some((ticket, pair)) => self.exchange(ticket, pair).await,
        };

        guard.settled = true;
        self.settle(outcome);
    }

    async fn exchange(&self, ticket: RefreshTicket, pair: CredentialPair) -> RefreshOutcome {
        if pair.refresh_token.is_empty() {
            self.machine.fail_refresh(ticket);
            return Err(RefreshError::NoRefreshToken);
        }

        info!("Refreshing access token");
        let result = match tokio::time::timeout(self.timeout, self.backend.refresh(&pair.refresh_token)).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Timeout(self.timeout)),
        };

        match result {
            Ok(response) => {
                let fresh = CredentialPair::new(response.access_token, response.refresh_token);
                if self.machine.complete_refresh(ticket, fresh.clone()) {
                    info!("Access token refreshed");
                } else {
                    info!("Session ended during refresh, discarding new credentials");
                }
                Ok(fresh.credential())
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, signing out");
                self.machine.fail_refresh(ticket);
                Err(e)
            }
        }
    }

    /// Clear the in-flight marker and answer every waiter, oldest first.
    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = self.lock().take().unwrap_or_default();
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Refresh settled");
        for waiter in waiters {
            // Receiver gone means the caller stopped waiting
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Settles the queue if the exchange task dies without doing so, so that no
/// waiter is left suspended and the marker cannot stay set.
struct SettleGuard {
    coordinator: RefreshCoordinator,
    ticket: Option<RefreshTicket>,
    settled: bool,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!("Refresh task ended without settling");
        if let Some(ticket) = self.ticket {
            self.coordinator.machine.fail_refresh(ticket);
        }
        self.coordinator.settle(Err(RefreshError::Superseded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::auth::credentials::{CredentialStore, MemoryCredentialStore, StoredSession};
    use crate::auth::state::SessionStatus;
    use crate::auth::token::test_tokens;
    use crate::models::{AuthResponse, LoginRequest, RegisterRequest, RegisterResponse, UserProfile};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    /// Backend whose refresh endpoint answers after `delay` with `outcome`.
    struct ScriptedBackend {
        delay: Duration,
        outcome: Result<(String, String), RefreshError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn succeeding(delay: Duration) -> Self {
            Self {
                delay,
                outcome: Ok((test_tokens::valid("anna-refreshed"), "refresh-2".to_string())),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(delay: Duration, error: RefreshError) -> Self {
            Self {
                delay,
                outcome: Err(error),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for ScriptedBackend {
        async fn login(&self, _request: &LoginRequest) -> Result<AuthResponse, ApiError> {
            Err(ApiError::InvalidResponse("not scripted".to_string()))
        }

        async fn register(&self, _request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
            Err(ApiError::InvalidResponse("not scripted".to_string()))
        }

        async fn refresh(&self, _refresh_token: &BearerToken) -> Result<AuthResponse, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone().map(|(access, refresh)| AuthResponse {
                access_token: access,
                refresh_token: refresh,
                token_type: "Bearer".to_string(),
                expires_in: 900,
            })
        }

        async fn profile(&self, _access_token: &BearerToken) -> Result<UserProfile, ApiError> {
            Err(ApiError::InvalidResponse("not scripted".to_string()))
        }

        async fn logout(&self, _access_token: &BearerToken) -> Result<(), ApiError> {
            Ok(())
        }

        async fn validate(&self, _access_token: &BearerToken) -> Result<bool, ApiError> {
            Ok(true)
        }
    }

    struct Harness {
        store: Arc<MemoryCredentialStore>,
        machine: Arc<AuthStateMachine>,
        backend: Arc<ScriptedBackend>,
        coordinator: RefreshCoordinator,
    }

    fn harness(backend: ScriptedBackend, timeout: Duration) -> Harness {
        let pair = CredentialPair::new(test_tokens::valid("anna"), "refresh-1");
        let store = Arc::new(MemoryCredentialStore::with_session(StoredSession::new(pair)));
        let machine = Arc::new(AuthStateMachine::new(store.clone()));
        machine.initialize();
        let backend = Arc::new(backend);
        let coordinator = RefreshCoordinator::new(machine.clone(), backend.clone(), timeout);
        Harness {
            store,
            machine,
            backend,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(50)),
            Duration::from_secs(5),
        );

        let calls = (0..8).map(|_| h.coordinator.ensure_fresh_credential());
        let results = join_all(calls).await;

        assert_eq!(h.backend.calls(), 1);
        assert_eq!(h.coordinator.exchanges_started(), 1);
        assert!(!h.coordinator.is_refreshing());

        let persisted = h.store.load().unwrap().unwrap().credentials.credential();
        for result in results {
            let credential = result.unwrap();
            assert_eq!(credential.access_token, persisted.access_token);
        }
        assert_eq!(h.machine.peek().status(), SessionStatus::Authenticated);
        assert_eq!(
            h.store.load().unwrap().unwrap().credentials.refresh_token.expose_secret(),
            "refresh-2"
        );
    }

    #[tokio::test]
    async fn test_failed_exchange_rejects_everyone_and_clears_store() {
        let h = harness(
            ScriptedBackend::failing(Duration::from_millis(20), RefreshError::Rejected { status: 401 }),
            Duration::from_secs(5),
        );

        let results = join_all((0..5).map(|_| h.coordinator.ensure_fresh_credential())).await;

        assert_eq!(h.backend.calls(), 1);
        for result in results {
            assert_eq!(result, Err(RefreshError::Rejected { status: 401 }));
        }
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(h.machine.peek(), SessionState::Unauthenticated);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_state_is_refreshing_while_in_flight() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(50)),
            Duration::from_secs(5),
        );

        let coordinator = h.coordinator.clone();
        let pending = tokio::spawn(async move { coordinator.ensure_fresh_credential().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.coordinator.is_refreshing());
        assert!(h.machine.peek().is_refreshing());

        pending.await.unwrap().unwrap();
        assert!(!h.coordinator.is_refreshing());
        assert_eq!(h.machine.peek().status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_waiters_settle_in_arrival_order() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(30)),
            Duration::from_secs(5),
        );
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let coordinator = h.coordinator.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let result = coordinator.ensure_fresh_credential().await;
                order.lock().unwrap().push(i);
                result
            }));
            // Make arrival order deterministic
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.backend.calls(), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timeout_is_treated_as_failure() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_secs(10)),
            Duration::from_millis(20),
        );

        let result = h.coordinator.ensure_fresh_credential().await;
        assert_eq!(result, Err(RefreshError::Timeout(Duration::from_millis(20))));
        assert!(!h.coordinator.is_refreshing());
        assert_eq!(h.machine.peek(), SessionState::Unauthenticated);
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_disturb_others() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(40)),
            Duration::from_secs(5),
        );

        let leader = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh_credential().await })
        };
        let follower = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh_credential().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The caller that started the exchange walks away
        leader.abort();

        assert!(follower.await.unwrap().is_ok());
        assert_eq!(h.backend.calls(), 1);
        assert_eq!(h.machine.peek().status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(40)),
            Duration::from_secs(5),
        );

        let waiter = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh_credential().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.machine.sign_out();

        // Waiters still get the new credential
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(h.machine.peek(), SessionState::Unauthenticated);
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_session_fails_fast() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(1)),
            Duration::from_secs(5),
        );
        h.machine.sign_out();

        let result = h.coordinator.ensure_fresh_credential().await;
        assert_eq!(result, Err(RefreshError::NoRefreshToken));
        assert_eq!(h.backend.calls(), 0);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_caller_after_settlement_starts_new_exchange() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(5)),
            Duration::from_secs(5),
        );

        h.coordinator.ensure_fresh_credential().await.unwrap();
        h.coordinator.ensure_fresh_credential().await.unwrap();
        assert_eq!(h.backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_token_already_replaced_skips_exchange() {
        let h = harness(
            ScriptedBackend::succeeding(Duration::from_millis(5)),
            Duration::from_secs(5),
        );
        let stale = BearerToken::new("an-older-token");

        let credential = h.coordinator.ensure_fresh_credential_after(&stale).await.unwrap();
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(
            Some(&credential.access_token),
            h.machine.peek().access_token()
        );

        let current = credential.access_token.clone();
        let fresh = h.coordinator.ensure_fresh_credential_after(&current).await.unwrap();
        assert_eq!(h.backend.calls(), 1);
        assert_ne!(fresh.access_token, current);
    }
}
