mod common;

use std::sync::Arc;
use std::time::Duration;

use crmv3_core::auth::{
    AuthError, CredentialStore, ExposeSecret, FileCredentialStore, GuardDecision, SessionState,
    SessionStatus,
};
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{auth_body, bearer, expired_token, session, session_with_store, stored, valid_token};

fn profile_body(role: &str) -> serde_json::Value {
    json!({
        "userId": 7,
        "username": "anna",
        "email": "anna@example.com",
        "firstName": "Anna",
        "lastName": "Berg",
        "role": role,
        "enabled": true
    })
}

async fn mount_login(server: &MockServer, access: &str) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "usernameOrEmail": "anna", "password": "secret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body(access, "refresh-1")))
        .mount(server)
        .await;
}

async fn mount_profile(server: &MockServer, access: &str, role: &str) {
    Mock::given(method("GET"))
        .and(path("/api/auth/profile"))
        .and(header("Authorization", bearer(access).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(profile_body(role)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn expired_token_at_startup_signs_out() {
    let server = MockServer::start().await;
    let (store, session) = session(&server, Some(stored(&expired_token("anna"), "refresh-1")));

    assert_eq!(session.current_state(), SessionState::Unauthenticated);
    assert!(store.load().unwrap().is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn login_fetches_profile() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    mount_login(&server, &access).await;
    mount_profile(&server, &access, "ADMIN").await;

    let (store, session) = session(&server, None);
    let profile = session.login("anna", "secret").await.unwrap().unwrap();

    assert_eq!(profile.display_name(), "Anna Berg");
    assert!(session.is_admin());
    assert!(session.has_role("ROLE_ADMIN"));
    assert_eq!(
        store.load().unwrap().unwrap().profile.map(|p| p.username),
        Some("anna".to_string())
    );
}

#[tokio::test]
async fn login_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (_store, session) = session(&server, None);
    let result = session.login("anna", "wrong").await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    assert_eq!(session.current_state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn session_survives_restart_with_file_store() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    mount_login(&server, &access).await;
    mount_profile(&server, &access, "USER").await;

    let dir = TempDir::new().unwrap();
    let first = session_with_store(&server, Arc::new(FileCredentialStore::new(dir.path().to_path_buf())));
    first.login("anna", "secret").await.unwrap();
    first.shutdown();

    let second = session_with_store(&server, Arc::new(FileCredentialStore::new(dir.path().to_path_buf())));
    let state = second.current_state();
    assert_eq!(state.status(), SessionStatus::Authenticated);
    assert_eq!(state.access_token().map(|t| t.expose_secret().to_string()), Some(access));
    // Cached profile is available before the background fetch lands
    assert!(second.has_role("USER"));
}

#[tokio::test]
async fn logout_calls_server_and_clears_locally() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .and(header("Authorization", bearer(&access).as_str()))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (store, session) = session(&server, Some(stored(&access, "refresh-1")));
    session.logout().await;

    assert_eq!(session.current_state(), SessionState::Unauthenticated);
    assert!(store.load().unwrap().is_none());
}

#[tokio::test]
async fn refresh_profile_goes_through_refresh_policy() {
    let server = MockServer::start().await;
    let old = valid_token("old");
    let new = valid_token("new");
    Mock::given(method("GET"))
        .and(path("/api/auth/profile"))
        .and(header("Authorization", bearer(&old).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    mount_profile(&server, &new, "ADMIN").await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body(&new, "refresh-2")))
        .expect(1)
        .mount(&server)
        .await;

    let (store, session) = session(&server, Some(stored(&old, "refresh-1")));
    // Let the startup fetch fail against the old token first
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.is_admin());

    let profile = session.refresh_profile().await.unwrap();
    assert_eq!(profile.username, "anna");
    assert!(session.is_admin());
    assert!(store.load().unwrap().unwrap().profile.is_some());
}

#[tokio::test]
async fn validate_asks_the_server() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    Mock::given(method("POST"))
        .and(path("/api/auth/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    let (_store, session) = session(&server, Some(stored(&access, "refresh-1")));
    assert!(session.validate().await);

    session.force_logout();
    assert!(!session.validate().await);
}

#[tokio::test]
async fn state_changes_follow_login_and_logout() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    mount_login(&server, &access).await;
    mount_profile(&server, &access, "USER").await;

    let (_store, session) = session(&server, None);
    let mut changes = Box::pin(session.state_changes());
    assert_eq!(changes.next().await, Some(SessionState::Unauthenticated));

    session.login("anna", "secret").await.unwrap();
    session.force_logout();

    let mut seen = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(Duration::from_millis(50), changes.next()).await {
        seen.push(state.status());
    }
    assert_eq!(seen.first(), Some(&SessionStatus::Authenticated));
    assert_eq!(seen.last(), Some(&SessionStatus::Unauthenticated));
}

#[tokio::test]
async fn route_guard_uses_session_roles() {
    let server = MockServer::start().await;
    let access = valid_token("anna");
    mount_profile(&server, &access, "USER").await;

    let (_store, session) = session(&server, Some(stored(&access, "refresh-1")));
    let guard = session.route_guard();

    assert_eq!(guard.check("/customers/3/edit", None).await, GuardDecision::Admit);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        guard.check("/statistics", None).await,
        GuardDecision::Redirect("/unauthorized".to_string())
    );

    session.force_logout();
    assert_eq!(
        guard.check("/customers", Some("/customers")).await,
        GuardDecision::Redirect("/login".to_string())
    );
}
