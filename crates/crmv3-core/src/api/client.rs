//! API client for protected CRM resources.
//!
//! Every call goes through [`RequestAuthMiddleware`], so callers never deal
//! with tokens. Rate-limited calls are retried with exponential backoff.

use std::time::Duration;

use reqwest::{header, Client, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::middleware::{RequestAuthMiddleware, RetryPolicy};
use super::ApiError;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if response is successful, returning an error with body if not.
pub(crate) async fn check_response(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    middleware: RequestAuthMiddleware,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(client: Client, base_url: &str, middleware: RequestAuthMiddleware) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            middleware,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff step.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn middleware(&self) -> &RequestAuthMiddleware {
        &self.middleware
    }

    /// Absolute URL for an API path such as `/customers/7`.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Send through the middleware, backing off on 429.
    ///
    /// The 401 budget covers the whole call, so a rate-limited resend cannot
    /// start a second refresh.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;
        let mut policy = RetryPolicy::NotTried;

        loop {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(header::ACCEPT, "application/json");
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let request = builder.build()?;

            let response = self.middleware.execute_with(request, &mut policy).await?;
            if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
                return check_response(response).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    async fn json<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path, "GET");
        let response = self.send::<()>(Method::GET, path, None).await?;
        Self::json(response, path).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        debug!(path, "POST");
        let response = self.send(Method::POST, path, Some(body)).await?;
        Self::json(response, path).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        debug!(path, "PUT");
        let response = self.send(Method::PUT, path, Some(body)).await?;
        Self::json(response, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        debug!(path, "DELETE");
        self.send::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }
}
