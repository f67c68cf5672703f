// Not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use crmv3_core::api::HttpAuthBackend;
use crmv3_core::auth::{CredentialPair, CredentialStore, MemoryCredentialStore, StoredSession};
use crmv3_core::{Config, SessionManager};
use serde_json::{json, Value};
use wiremock::MockServer;

/// Unsigned JWT-shaped token carrying `payload`.
pub fn mint(payload: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.signature", header, body)
}

/// Token for `subject` valid for another 15 minutes.
pub fn valid_token(subject: &str) -> String {
    mint(json!({
        "sub": subject,
        "exp": (Utc::now() + Duration::minutes(15)).timestamp(),
        "iat": Utc::now().timestamp(),
    }))
}

/// Token for `subject` that expires within the next second.
pub fn short_lived_token(subject: &str) -> String {
    mint(json!({
        "sub": subject,
        "exp": (Utc::now() + Duration::seconds(1)).timestamp(),
    }))
}

pub fn expired_token(subject: &str) -> String {
    mint(json!({
        "sub": subject,
        "exp": (Utc::now() - Duration::seconds(1)).timestamp(),
    }))
}

/// Body of a successful login or refresh.
pub fn auth_body(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "accessToken": access_token,
        "refreshToken": refresh_token,
        "tokenType": "Bearer",
        "expiresIn": 900
    })
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

pub fn stored(access_token: &str, refresh_token: &str) -> StoredSession {
    StoredSession::new(CredentialPair::new(access_token, refresh_token))
}

pub fn config_for(server: &MockServer) -> Config {
    Config {
        api_base_url: format!("{}/api", server.uri()),
        refresh_timeout_secs: 5,
        ..Config::default()
    }
}

/// Session against `server` backed by `store`, already initialized.
pub fn session_with_store(server: &MockServer, store: Arc<dyn CredentialStore>) -> SessionManager {
    let config = config_for(server);
    let client = reqwest::Client::new();
    let backend = Arc::new(HttpAuthBackend::with_client(client.clone(), &config.api_base_url));
    let session = SessionManager::with_parts(config, store, backend, client);
    session.init();
    session
}

pub fn session(server: &MockServer, stored: Option<StoredSession>) -> (Arc<MemoryCredentialStore>, SessionManager) {
    let store = Arc::new(match stored {
        Some(s) => MemoryCredentialStore::with_session(s),
        None => MemoryCredentialStore::new(),
    });
    let session = session_with_store(server, store.clone());
    (store, session)
}
