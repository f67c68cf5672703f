use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

/// Failure to read the claims out of an access token.
///
/// Never fatal: callers treat any decode failure as "token expired".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Token is not made of three dot-separated segments")]
    MalformedToken,

    #[error("Token payload is not valid base64url: {0}")]
    InvalidEncoding(String),

    #[error("Token payload is not a JSON object: {0}")]
    InvalidPayload(String),

    #[error("Token has no expiry claim")]
    MissingExpiry,

    #[error("Token expiry claim is not numeric")]
    InvalidExpiry,
}

/// Failure of the durable credential store.
///
/// Never fatal: a failed load is treated exactly like "no credential".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Credential storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stored credentials are corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Self::Unavailable(error.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Corrupt(error.to_string())
    }
}

impl From<keyring::Error> for StorageError {
    fn from(error: keyring::Error) -> Self {
        Self::Unavailable(error.to_string())
    }
}

/// Outcome of a failed refresh exchange.
///
/// One value is cloned to every caller that waited on the same exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected (status {status})")]
    Rejected { status: u16 },

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("Refresh was abandoned before it settled")]
    Superseded,
}

/// Errors surfaced to collaborators of the session subsystem.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Access denied")]
    AuthorizationDenied,

    #[error("Authentication failed after token refresh")]
    AuthenticationFailed,

    #[error("Not logged in")]
    NotAuthenticated,

    #[error(transparent)]
    Api(#[from] ApiError),
}
