//! The session handle handed to every collaborator.
//!
//! One `SessionManager` per process, created at startup and cloned freely.
//! It owns the state machine, the refresh coordinator and the middleware,
//! and exposes the operations UI and CLI code use: state snapshots and
//! subscriptions, login/logout, fresh credentials and authenticated API
//! access.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::Stream;
use reqwest::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialPair, CredentialStore};
use super::error::{AuthError, RefreshError};
use super::guard::{RouteAccessGuard, RouteTable};
use super::refresh::RefreshCoordinator;
use super::state::{AuthStateMachine, AuthenticatedSession, SessionEpoch, SessionState};
use super::token::{BearerToken, TokenCodec};
use crate::api::backend::PROFILE_PATH;
use crate::api::{ApiClient, ApiError, AuthBackend, HttpAuthBackend, RequestAuthMiddleware};
use crate::config::Config;
use crate::models::{LoginRequest, RegisterRequest, RegisterResponse, UserProfile};

const ADMIN_ROLE: &str = "ADMIN";

/// Clone is cheap; all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    machine: Arc<AuthStateMachine>,
    backend: Arc<dyn AuthBackend>,
    coordinator: RefreshCoordinator,
    api: ApiClient,
    profile_tasks: Mutex<Vec<AbortHandle>>,
}

/// What a background profile fetch needs, detached from the manager.
#[derive(Clone)]
struct ProfileLoader {
    machine: Arc<AuthStateMachine>,
    backend: Arc<dyn AuthBackend>,
    allow_unverified: bool,
}

impl ProfileLoader {
    /// Fetch the profile for the session identified by `epoch`.
    ///
    /// On failure the cached profile is kept. Without one, and only when
    /// allowed, the unverified token claims stand in.
    async fn load(&self, epoch: SessionEpoch, token: BearerToken) -> Option<UserProfile> {
        match self.backend.profile(&token).await {
            Ok(profile) => {
                if self.machine.update_profile(epoch, profile.clone()) {
                    debug!(username = %profile.username, "Profile loaded");
                }
                Some(profile)
            }
            Err(e) => {
                warn!(error = %e, "Profile fetch failed");
                if let Some(cached) = self.machine.profile_for(epoch) {
                    debug!("Keeping cached profile");
                    return Some(cached);
                }
                if !self.allow_unverified {
                    return None;
                }
                let profile = TokenCodec::decode(token.expose_secret()).ok()?.to_unverified_profile();
                if !self.machine.update_profile(epoch, profile.clone()) {
                    debug!("Session changed while fetching profile");
                    return None;
                }
                warn!(username = %profile.username, "Using unverified token claims as profile");
                Some(profile)
            }
        }
    }
}

impl SessionManager {
    /// Wire a session from `config` with the HTTP backend and the configured
    /// credential store.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = config.credential_store()?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let backend = Arc::new(HttpAuthBackend::with_client(client.clone(), &config.api_base_url));
        Ok(Self::with_parts(config, store, backend, client))
    }

    /// Wire a session from explicit parts.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        client: Client,
    ) -> Self {
        let machine = Arc::new(AuthStateMachine::new(store));
        let coordinator = RefreshCoordinator::new(machine.clone(), backend.clone(), config.refresh_timeout());
        let middleware = RequestAuthMiddleware::new(client.clone(), machine.clone(), coordinator.clone());
        let api = ApiClient::new(client, &config.api_base_url, middleware);
        Self {
            inner: Arc::new(Inner {
                config,
                machine,
                backend,
                coordinator,
                api,
                profile_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn loader(&self) -> ProfileLoader {
        ProfileLoader {
            machine: self.inner.machine.clone(),
            backend: self.inner.backend.clone(),
            allow_unverified: self.inner.config.allow_unverified_profile_fallback,
        }
    }

    /// Restore the stored session. A restored session gets its profile
    /// refreshed in the background. Must run inside a tokio runtime.
    pub fn init(&self) {
        let Some(epoch) = self.inner.machine.initialize() else {
            return;
        };
        let Some(token) = self.inner.machine.peek().access_token().cloned() else {
            return;
        };

        let loader = self.loader();
        let handle = tokio::spawn(async move {
            loader.load(epoch, token).await;
        });
        let mut tasks = self.inner.profile_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());
    }

    /// Stop background profile fetches. An in-flight refresh is left to
    /// finish so the credential store stays consistent.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self.inner.profile_tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        debug!("Session shut down");
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state_machine(&self) -> &Arc<AuthStateMachine> {
        &self.inner.machine
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.machine.current_state()
    }

    pub async fn await_ready(&self) {
        self.inner.machine.await_ready().await
    }

    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        self.inner.machine.state_changes()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.inner.machine.has_role(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_state().is_authenticated()
    }

    /// Guard over the CRM routes backed by this session.
    pub fn route_guard(&self) -> RouteAccessGuard {
        RouteAccessGuard::new(self.inner.machine.clone(), RouteTable::crm())
    }

    /// Log in and load the profile. A failed profile fetch does not fail
    /// the login.
    pub async fn login(&self, username_or_email: &str, password: &str) -> Result<Option<UserProfile>, AuthError> {
        let request = LoginRequest::new(username_or_email, password);
        let response = self.inner.backend.login(&request).await.map_err(|e| match e {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => AuthError::InvalidCredentials,
            other => AuthError::Api(other),
        })?;

        let credentials = CredentialPair::new(response.access_token, response.refresh_token);
        let token = credentials.access_token.clone();
        let epoch = self
            .inner
            .machine
            .sign_in(AuthenticatedSession::new(credentials, None));
        info!(user = username_or_email, "Logged in");

        Ok(self.loader().load(epoch, token).await)
    }

    /// Create an account. Does not sign in.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, AuthError> {
        let response = self.inner.backend.register(request).await?;
        info!(username = %request.username, success = response.success, "Registration submitted");
        Ok(response)
    }

    /// Sign out locally, then tell the server on a best-effort basis.
    pub async fn logout(&self) {
        let Some(previous) = self.force_logout() else {
            return;
        };
        if let Err(e) = self.inner.backend.logout(&previous.credentials.access_token).await {
            debug!(error = %e, "Remote logout failed, ignoring");
        }
    }

    /// Local sign-out without contacting the server. Returns the session
    /// that was torn down.
    pub fn force_logout(&self) -> Option<AuthenticatedSession> {
        self.shutdown();
        let previous = self.inner.machine.sign_out();
        if previous.is_some() {
            info!("Logged out");
        }
        previous
    }

    pub async fn ensure_fresh_credential(&self) -> Result<Credential, RefreshError> {
        self.inner.coordinator.ensure_fresh_credential().await
    }

    /// The access token an outbound request would carry right now.
    pub async fn access_token(&self) -> Result<Option<BearerToken>, AuthError> {
        let middleware = self.middleware();
        Ok(middleware.current_token().await?)
    }

    /// Add the current bearer token to a request built elsewhere.
    pub async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        Ok(match self.access_token().await? {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        })
    }

    /// Client for protected resources.
    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    fn middleware(&self) -> RequestAuthMiddleware {
        self.inner.api.middleware().clone()
    }

    /// Fetch the profile now, through the refresh-and-retry policy.
    pub async fn refresh_profile(&self) -> Result<UserProfile, AuthError> {
        let epoch = self.inner.machine.epoch().ok_or(AuthError::NotAuthenticated)?;
        let profile: UserProfile = self.inner.api.get(PROFILE_PATH).await.map_err(|e| match e {
            ApiError::AccessDenied(_) => AuthError::AuthorizationDenied,
            ApiError::AuthenticationFailed => AuthError::AuthenticationFailed,
            ApiError::Refresh(e) => AuthError::Refresh(e),
            other => AuthError::Api(other),
        })?;
        // A refresh in between keeps the epoch; a re-login does not
        if !self.inner.machine.update_profile(epoch, profile.clone()) {
            debug!("Session changed while fetching profile, not storing it");
        }
        Ok(profile)
    }

    /// Ask the server whether the current access token is still accepted.
    /// Any failure counts as "no".
    pub async fn validate(&self) -> bool {
        let state = self.current_state();
        let Some(token) = state.access_token() else {
            return false;
        };
        if TokenCodec::is_expired(token.expose_secret(), Utc::now()) {
            return false;
        }
        match self.inner.backend.validate(token).await {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "Token validation failed");
                false
            }
        }
    }
}
