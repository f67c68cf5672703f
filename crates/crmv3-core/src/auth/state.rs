//! Session state machine.
//!
//! ```text
//!  Uninitialized ──init──► Authenticated ◄──────── refresh ok ──┐
//!        │                  │   │    ▲                          │
//!        │ no/expired token │   │    └── login ── Unauthenticated
//!        ▼                  │   └── refresh ──► RefreshingInPlace
//!  Unauthenticated ◄────────┴── expiry / logout ◄──┴── refresh failed / logout
//! ```
//!
//! The machine is the only writer of the credential store besides the
//! refresh coordinator, which goes through [`AuthStateMachine::complete_refresh`]
//! and [`AuthStateMachine::fail_refresh`]. Store writes happen inside the
//! same critical section as the transition they belong to, so a logout can
//! never be interleaved between a refresh's state change and its persist.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use secrecy::ExposeSecret;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::credentials::{CredentialPair, CredentialStore, StoredSession};
use super::token::{BearerToken, TokenCodec};
use crate::models::UserProfile;

/// Buffered state changes per subscriber before it starts lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedSession {
    pub credentials: CredentialPair,
    pub profile: Option<UserProfile>,
}

impl AuthenticatedSession {
    pub fn new(credentials: CredentialPair, profile: Option<UserProfile>) -> Self {
        Self {
            credentials,
            profile,
        }
    }

    fn to_stored(&self) -> StoredSession {
        StoredSession {
            credentials: self.credentials.clone(),
            profile: self.profile.clone(),
        }
    }
}

impl From<StoredSession> for AuthenticatedSession {
    fn from(stored: StoredSession) -> Self {
        Self {
            credentials: stored.credentials,
            profile: stored.profile,
        }
    }
}

/// Snapshot of the session.
///
/// `RefreshingInPlace` carries the authenticated session it is refreshing;
/// it can only be entered from `Authenticated`, so it never nests.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Uninitialized,
    Unauthenticated,
    Authenticated(AuthenticatedSession),
    RefreshingInPlace(AuthenticatedSession),
}

/// Payload-free view of [`SessionState`] for display and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    Uninitialized,
    Unauthenticated,
    Authenticated,
    RefreshingInPlace,
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Unauthenticated => SessionStatus::Unauthenticated,
            SessionState::Authenticated(_) => SessionStatus::Authenticated,
            SessionState::RefreshingInPlace(_) => SessionStatus::RefreshingInPlace,
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self, SessionState::Uninitialized)
    }

    /// Authenticated, or refreshing an authenticated session.
    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, SessionState::RefreshingInPlace(_))
    }

    pub fn session(&self) -> Option<&AuthenticatedSession> {
        match self {
            SessionState::Authenticated(session) | SessionState::RefreshingInPlace(session) => {
                Some(session)
            }
            _ => None,
        }
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.session().and_then(|s| s.profile.as_ref())
    }

    pub fn access_token(&self) -> Option<&BearerToken> {
        self.session().map(|s| &s.credentials.access_token)
    }
}

/// Proof that the holder moved the machine into `RefreshingInPlace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    epoch: u64,
}

/// Handle for writing a profile back into the session it was fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEpoch(u64);

struct Inner {
    state: SessionState,
    /// Bumped whenever the signed-in session is replaced or torn down.
    epoch: u64,
}

pub struct AuthStateMachine {
    inner: Mutex<Inner>,
    store: Arc<dyn CredentialStore>,
    changes: broadcast::Sender<SessionState>,
    ready: watch::Sender<bool>,
}

impl AuthStateMachine {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (ready, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                epoch: 0,
            }),
            store,
            changes,
            ready,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &mut Inner, next: SessionState) {
        debug!(from = ?inner.state.status(), to = ?next.status(), "Session transition");
        inner.state = next.clone();
        // No receivers is fine
        let _ = self.changes.send(next);
        if inner.state.is_ready() {
            self.ready.send_replace(true);
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
    }

    fn persist(&self, session: &AuthenticatedSession) {
        if let Err(e) = self.store.save(&session.to_stored()) {
            warn!(error = %e, "Failed to persist session");
        }
    }

    /// Resolve `Uninitialized` from the credential store.
    ///
    /// A load failure, a missing pair, an undecodable or locally expired
    /// access token all land in `Unauthenticated` with the store cleared.
    /// Returns the epoch of the restored session, if any.
    pub fn initialize(&self) -> Option<SessionEpoch> {
        let mut inner = self.lock();
        if inner.state.is_ready() {
            return None;
        }

        let loaded = match self.store.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Credential store unreadable, starting signed out");
                None
            }
        };

        inner.epoch += 1;
        match loaded {
            Some(stored) if !TokenCodec::is_expired(stored.credentials.access_token.expose_secret(), Utc::now()) => {
                info!("Restored session from credential store");
                self.publish(&mut inner, SessionState::Authenticated(stored.into()));
                Some(SessionEpoch(inner.epoch))
            }
            Some(_) => {
                info!("Stored access token expired or unreadable, signing out");
                self.clear_store();
                self.publish(&mut inner, SessionState::Unauthenticated);
                None
            }
            None => {
                self.clear_store();
                self.publish(&mut inner, SessionState::Unauthenticated);
                None
            }
        }
    }

    /// Current snapshot, after applying the local expiry check.
    ///
    /// An `Authenticated` session whose access token has expired (or cannot
    /// be decoded) is signed out right here.
    pub fn current_state(&self) -> SessionState {
        let mut inner = self.lock();
        let expired = match &inner.state {
            SessionState::Authenticated(session) => {
                TokenCodec::is_expired(session.credentials.access_token.expose_secret(), Utc::now())
            }
            _ => false,
        };
        if expired {
            info!("Access token expired locally, signing out");
            inner.epoch += 1;
            self.clear_store();
            self.publish(&mut inner, SessionState::Unauthenticated);
        }
        inner.state.clone()
    }

    /// Snapshot without the expiry check.
    pub fn peek(&self) -> SessionState {
        self.lock().state.clone()
    }

    /// Suspend until initialization has resolved. Immediate afterwards.
    pub async fn await_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Current state first, then every later change.
    ///
    /// The stream ends only when the machine itself is dropped. Dropping the
    /// stream just unsubscribes.
    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        let (current, mut rx) = {
            let inner = self.lock();
            (inner.state.clone(), self.changes.subscribe())
        };

        async_stream::stream! {
            yield current;
            loop {
                match rx.recv().await {
                    Ok(state) => yield state,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State subscriber lagging, skipped changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Role check against the last known profile. False when signed out.
    pub fn has_role(&self, role: &str) -> bool {
        self.current_state()
            .profile()
            .map(|p| p.has_role(role))
            .unwrap_or(false)
    }

    /// Install a freshly logged-in session and persist it.
    pub fn sign_in(&self, session: AuthenticatedSession) -> SessionEpoch {
        let mut inner = self.lock();
        inner.epoch += 1;
        self.persist(&session);
        self.publish(&mut inner, SessionState::Authenticated(session));
        SessionEpoch(inner.epoch)
    }

    /// Explicit or forced logout. Returns the session that was torn down.
    pub fn sign_out(&self) -> Option<AuthenticatedSession> {
        let mut inner = self.lock();
        let previous = inner.state.session().cloned();
        inner.epoch += 1;
        self.clear_store();
        if !matches!(inner.state, SessionState::Unauthenticated) {
            self.publish(&mut inner, SessionState::Unauthenticated);
        }
        previous
    }

    /// `Authenticated → RefreshingInPlace`. `None` from any other state.
    pub fn begin_refresh(&self) -> Option<(RefreshTicket, CredentialPair)> {
        let mut inner = self.lock();
        let session = match &inner.state {
            SessionState::Authenticated(session) => session.clone(),
            _ => return None,
        };
        let pair = session.credentials.clone();
        self.publish(&mut inner, SessionState::RefreshingInPlace(session));
        Some((RefreshTicket { epoch: inner.epoch }, pair))
    }

    /// `RefreshingInPlace → Authenticated` with the new pair persisted.
    ///
    /// Returns false, touching nothing, when the session was signed out or
    /// replaced while the exchange was running.
    pub fn complete_refresh(&self, ticket: RefreshTicket, credentials: CredentialPair) -> bool {
        let mut inner = self.lock();
        let profile = match &inner.state {
            SessionState::RefreshingInPlace(session) if inner.epoch == ticket.epoch => {
                session.profile.clone()
            }
            _ => return false,
        };
        let session = AuthenticatedSession::new(credentials, profile);
        self.persist(&session);
        self.publish(&mut inner, SessionState::Authenticated(session));
        true
    }

    /// `RefreshingInPlace → Unauthenticated` with the store cleared.
    pub fn fail_refresh(&self, ticket: RefreshTicket) -> bool {
        let mut inner = self.lock();
        match &inner.state {
            SessionState::RefreshingInPlace(_) if inner.epoch == ticket.epoch => {}
            _ => return false,
        }
        inner.epoch += 1;
        self.clear_store();
        self.publish(&mut inner, SessionState::Unauthenticated);
        true
    }

    /// Epoch of the current signed-in session.
    pub fn epoch(&self) -> Option<SessionEpoch> {
        let inner = self.lock();
        inner.state.session().map(|_| SessionEpoch(inner.epoch))
    }

    /// Profile of the session identified by `epoch`, if that session is
    /// still the current one.
    pub fn profile_for(&self, epoch: SessionEpoch) -> Option<UserProfile> {
        let inner = self.lock();
        if inner.epoch != epoch.0 {
            return None;
        }
        inner.state.profile().cloned()
    }

    /// Replace the profile of the session identified by `epoch`.
    ///
    /// While a refresh is in flight the profile is stored silently; it
    /// reaches subscribers with the refresh's own `Authenticated` change.
    pub fn update_profile(&self, epoch: SessionEpoch, profile: UserProfile) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch.0 {
            return false;
        }
        match &mut inner.state {
            SessionState::Authenticated(session) => {
                let next = AuthenticatedSession::new(session.credentials.clone(), Some(profile));
                self.persist(&next);
                self.publish(&mut inner, SessionState::Authenticated(next));
            }
            SessionState::RefreshingInPlace(session) => {
                session.profile = Some(profile);
                self.persist(session);
            }
            _ => return false,
        }
        true
    }
}
