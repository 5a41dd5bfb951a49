// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for sign-in and transparent token refresh, run against
//! the in-memory development server.
//!
//! These tests validate:
//! - Login and registration store a credential pair and a profile
//! - Many requests failing on one expired access token share one refresh
//! - A rejected refresh token ends the session and clears the store
//! - A durable session survives reopening its file

use std::sync::Arc;

use taskman::credentials::CredentialStore;
use taskman::gateway::ApiError;
use taskman::session::Session;
use taskman::transport::http::ReqwestTransport;
use taskman_devserver::server::{self, ServerState};
use taskman_proto::task::NewTask;

const EMAIL: &str = "ann@example.com";
const PASSWORD: &str = "correct horse";

async fn start() -> (String, Arc<ServerState>) {
    let (addr, _handle, state) = server::start_server("127.0.0.1:0").await.unwrap();
    (format!("http://{addr}/api"), state)
}

fn session_with(api_base: &str, credentials: CredentialStore) -> Session<ReqwestTransport> {
    Session::new(
        ReqwestTransport::new(api_base).unwrap(),
        Arc::new(credentials),
    )
}

async fn registered(api_base: &str) -> Session<ReqwestTransport> {
    let session = session_with(api_base, CredentialStore::in_memory());
    session
        .api()
        .register(EMAIL, PASSWORD, Some("Ann"))
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn register_signs_in() {
    let (base, _state) = start().await;
    let session = registered(&base).await;

    assert!(session.is_authenticated());
    let profile = session.credentials().profile().unwrap();
    assert_eq!(profile.email, EMAIL);
    assert_eq!(profile.name, "Ann");

    // A second session logging in with the same account gets its own tokens.
    let other = session_with(&base, CredentialStore::in_memory());
    let profile = other.api().login(EMAIL, PASSWORD).await.unwrap();
    assert_eq!(profile.name, "ann");
    assert_ne!(
        other.credentials().access_token(),
        session.credentials().access_token()
    );
}

#[tokio::test]
async fn wrong_password_is_an_authentication_error() {
    let (base, _state) = start().await;
    registered(&base).await;

    let session = session_with(&base, CredentialStore::in_memory());
    let result = session.api().login(EMAIL, "wrong").await;
    assert!(matches!(result, Err(ApiError::Authentication(_))));
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn concurrent_expiry_refreshes_once() {
    let (base, state) = start().await;
    let session = registered(&base).await;
    for title in ["a", "b", "c"] {
        session
            .api()
            .create_task(&NewTask::titled(title))
            .await
            .unwrap();
    }
    let old_access = session.credentials().access_token().unwrap();

    state.revoke_access_tokens();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let api = Arc::clone(session.api());
        handles.push(tokio::spawn(async move { api.list_tasks().await }));
    }
    for handle in handles {
        let tasks = handle.await.unwrap().unwrap();
        assert_eq!(tasks.len(), 3);
    }

    assert_eq!(state.refresh_calls(), 1);
    let new_access = session.credentials().access_token().unwrap();
    assert_ne!(new_access, old_access);
    assert_eq!(session.api().gateway().refresh_flights(), 1);
}

#[tokio::test]
async fn revoked_refresh_token_ends_session() {
    let (base, state) = start().await;
    let session = registered(&base).await;

    state.revoke_access_tokens();
    state.revoke_refresh_tokens();

    let result = session.api().list_tasks().await;
    assert!(matches!(result, Err(ApiError::Authentication(_))));
    assert!(!session.is_authenticated());
    assert!(session.credentials().profile().is_none());
    assert_eq!(state.refresh_calls(), 1);

    // Without credentials nothing is refreshed any more.
    let result = session.api().list_tasks().await;
    assert!(matches!(result, Err(ApiError::Authentication(_))));
    assert_eq!(state.refresh_calls(), 1);
}

#[tokio::test]
async fn durable_session_survives_reopen() {
    let (base, _state) = start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let session = session_with(&base, CredentialStore::open(&path));
    session
        .api()
        .register(EMAIL, PASSWORD, None)
        .await
        .unwrap();
    session
        .api()
        .create_task(&NewTask::titled("persisted"))
        .await
        .unwrap();
    drop(session);

    let reopened = session_with(&base, CredentialStore::open(&path));
    assert!(reopened.is_authenticated());
    let tasks = reopened.api().list_tasks().await.unwrap();
    assert_eq!(tasks[0].title, "persisted");

    reopened.api().logout();
    assert!(!session_with(&base, CredentialStore::open(&path)).is_authenticated());
}
