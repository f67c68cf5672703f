//! Bearer attachment and refresh-on-401 for every outbound API call.
//!
//! Per request:
//! - authentication endpoints pass through untouched;
//! - otherwise the most recent access token is attached, refreshed first
//!   when it has already expired locally;
//! - a 401 drives one refresh and one retry, a second 401 is final;
//! - a 403 signs the session out without attempting a refresh.

use std::sync::Arc;

use chrono::Utc;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode, Url};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::backend::EXCLUDED_PATHS;
use super::ApiError;
use crate::auth::{AuthStateMachine, BearerToken, RefreshCoordinator, SessionState, TokenCodec};

/// Retry budget of one request with respect to 401 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// No 401 seen yet.
    NotTried,
    /// Refreshed once and retried.
    Tried,
    /// Rejected again after the retry; no further attempts.
    GaveUp,
}

impl RetryPolicy {
    /// Next policy after a 401.
    pub fn after_unauthorized(self) -> Self {
        match self {
            RetryPolicy::NotTried => RetryPolicy::Tried,
            RetryPolicy::Tried | RetryPolicy::GaveUp => RetryPolicy::GaveUp,
        }
    }

    pub fn may_retry(self) -> bool {
        self == RetryPolicy::Tried
    }
}

/// True for the authentication endpoints that bypass the middleware.
pub fn is_excluded(url: &Url) -> bool {
    let path = url.path().trim_end_matches('/');
    EXCLUDED_PATHS.iter().any(|excluded| path.ends_with(excluded))
}

/// Clone is cheap; all parts are shared.
#[derive(Clone)]
pub struct RequestAuthMiddleware {
    client: Client,
    machine: Arc<AuthStateMachine>,
    coordinator: RefreshCoordinator,
}

impl RequestAuthMiddleware {
    pub fn new(client: Client, machine: Arc<AuthStateMachine>, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            machine,
            coordinator,
        }
    }

    /// The access token to attach right now.
    ///
    /// While a refresh is in flight this joins it, and a token that has
    /// already expired locally is refreshed first, so a token that is being
    /// replaced or is known to be dead is never sent.
    pub async fn current_token(&self) -> Result<Option<BearerToken>, ApiError> {
        self.token_for_request(&mut RetryPolicy::NotTried).await
    }

    async fn token_for_request(&self, policy: &mut RetryPolicy) -> Result<Option<BearerToken>, ApiError> {
        let expired = match self.machine.peek() {
            SessionState::Authenticated(session) => {
                let token = session.credentials.access_token;
                if !TokenCodec::is_expired(token.expose_secret(), Utc::now()) {
                    return Ok(Some(token));
                }
                token
            }
            SessionState::RefreshingInPlace(session) => {
                debug!("Refresh in flight, waiting before attaching token");
                let credential = self
                    .coordinator
                    .ensure_fresh_credential_after(&session.credentials.access_token)
                    .await?;
                return Ok(Some(credential.access_token));
            }
            SessionState::Uninitialized | SessionState::Unauthenticated => return Ok(None),
        };

        info!("Access token expired, refreshing before sending");
        // Counts as this request's one rejection
        *policy = policy.after_unauthorized();
        let credential = self.coordinator.ensure_fresh_credential_after(&expired).await?;
        Ok(Some(credential.access_token))
    }

    /// Send `request` with the auth policy applied.
    ///
    /// Non-401/403 responses, including other errors, are returned as-is for
    /// the caller to interpret.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        self.execute_with(request, &mut RetryPolicy::NotTried).await
    }

    /// [`Self::execute`] with the 401 budget supplied by the caller, for
    /// callers that resend the same logical request (e.g. after a 429).
    pub async fn execute_with(&self, request: Request, policy: &mut RetryPolicy) -> Result<Response, ApiError> {
        if is_excluded(request.url()) {
            debug!(path = request.url().path(), "Excluded endpoint, passing through");
            return Ok(self.client.execute(request).await?);
        }

        let mut request = request;
        let mut attached = self.token_for_request(policy).await?;
        loop {
            // Kept for the retry; streaming bodies cannot be replayed
            let replay = request.try_clone();
            if let Some(token) = &attached {
                request.headers_mut().insert(AUTHORIZATION, bearer_header(token)?);
            }

            let url = request.url().clone();
            let response = self.client.execute(request).await?;

            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    *policy = policy.after_unauthorized();
                    if !policy.may_retry() {
                        warn!(path = url.path(), "Rejected again after refresh, giving up");
                        return Err(ApiError::AuthenticationFailed);
                    }
                    let next = replay.ok_or(ApiError::RequestNotCloneable)?;

                    info!(path = url.path(), "Access token rejected, refreshing");
                    let refreshed = match &attached {
                        Some(token) => self.coordinator.ensure_fresh_credential_after(token).await,
                        None => self.coordinator.ensure_fresh_credential().await,
                    };
                    // Retry with exactly the credential the refresh produced
                    attached = Some(refreshed?.access_token);
                    request = next;
                }
                StatusCode::FORBIDDEN => {
                    let body = response.text().await.unwrap_or_default();
                    warn!(path = url.path(), "Access forbidden, signing out");
                    self.machine.sign_out();
                    return Err(ApiError::from_status(StatusCode::FORBIDDEN, &body));
                }
                _ => return Ok(response),
            }
        }
    }
}

fn bearer_header(token: &BearerToken) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|_| ApiError::InvalidResponse("access token is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}
