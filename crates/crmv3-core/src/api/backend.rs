//! Remote authentication endpoints.
//!
//! The session core talks to the server only through [`AuthBackend`], so the
//! refresh machinery can be driven by a scripted backend in tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::ExposeSecret;
use tracing::debug;

use super::client::check_response;
use super::ApiError;
use crate::auth::{BearerToken, RefreshError};
use crate::config::Config;
use crate::models::{AuthResponse, LoginRequest, RegisterRequest, RegisterResponse, UserProfile};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const PROFILE_PATH: &str = "/auth/profile";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const VALIDATE_PATH: &str = "/auth/validate";

/// Endpoints that must never go through the refresh-and-retry machinery.
pub const EXCLUDED_PATHS: &[&str] = &[LOGIN_PATH, REGISTER_PATH, REFRESH_PATH];

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError>;

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError>;

    /// Exchange the refresh token for a new pair.
    async fn refresh(&self, refresh_token: &BearerToken) -> Result<AuthResponse, RefreshError>;

    async fn profile(&self, access_token: &BearerToken) -> Result<UserProfile, ApiError>;

    /// Best effort; callers sign out locally whatever this returns.
    async fn logout(&self, access_token: &BearerToken) -> Result<(), ApiError>;

    async fn validate(&self, access_token: &BearerToken) -> Result<bool, ApiError>;
}

/// [`AuthBackend`] over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, &config.api_base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn validate_auth_response(response: AuthResponse) -> Result<AuthResponse, String> {
    if response.access_token.trim().is_empty() {
        return Err("empty access token".to_string());
    }
    if response.refresh_token.trim().is_empty() {
        return Err("empty refresh token".to_string());
    }
    Ok(response)
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .header(header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await?;
        let response = check_response(response).await?;
        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)))?;
        validate_auth_response(auth).map_err(ApiError::InvalidResponse)
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        let response = self
            .client
            .post(self.url(REGISTER_PATH))
            .json(request)
            .send()
            .await?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("register response: {}", e)))
    }

    async fn refresh(&self, refresh_token: &BearerToken) -> Result<AuthResponse, RefreshError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .bearer_auth(refresh_token.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Refresh exchange rejected");
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        validate_auth_response(auth).map_err(RefreshError::InvalidResponse)
    }

    async fn profile(&self, access_token: &BearerToken) -> Result<UserProfile, ApiError> {
        let response = self
            .client
            .get(self.url(PROFILE_PATH))
            .bearer_auth(access_token.expose_secret())
            .send()
            .await?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("profile response: {}", e)))
    }

    async fn logout(&self, access_token: &BearerToken) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .bearer_auth(access_token.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn validate(&self, access_token: &BearerToken) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.url(VALIDATE_PATH))
            .bearer_auth(access_token.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("validate response: {}", e)))
    }
}
