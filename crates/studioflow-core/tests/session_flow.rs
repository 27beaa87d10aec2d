//! End-to-end session scenarios against a local mock of the StudioFlow API.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use mockito::{Matcher, Server};
use reqwest::Client;
use serde_json::{json, Value};

use studioflow_core::api::{ApiError, ApiRequest, RequestPipeline};
use studioflow_core::auth::{
    AuthState, AuthStateMachine, CredentialStore, MemoryBackend, SecretBackend, SessionRepository,
    UnauthorizedNotifier, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SIGN_IN_FAILED_MESSAGE,
};

const PROFILE: &str = r#"{
    "user": {"id": 12, "username": "meera", "full_name": "Meera Iyer", "email": "meera@studio.test", "role": "project_manager"},
    "permissions": {"projects": true, "clients": true, "finance": false, "docs": "yes"}
}"#;

/// Backend shared with the test so durable contents can be inspected.
#[derive(Clone, Default)]
struct SharedBackend(Arc<MemoryBackend>);

impl SecretBackend for SharedBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.0.delete(key)
    }
}

struct Stack {
    backend: SharedBackend,
    credentials: Arc<CredentialStore>,
    notifier: UnauthorizedNotifier,
    pipeline: Arc<RequestPipeline>,
    machine: Arc<AuthStateMachine>,
}

fn stack(server: &Server, stored: Option<(&str, &str)>) -> Stack {
    let backend = SharedBackend::default();
    if let Some((access, refresh)) = stored {
        backend.set(ACCESS_TOKEN_KEY, access).unwrap();
        backend.set(REFRESH_TOKEN_KEY, refresh).unwrap();
    }
    let credentials = Arc::new(CredentialStore::new(Box::new(backend.clone())));
    credentials.load().unwrap();

    let notifier = UnauthorizedNotifier::new();
    let pipeline = Arc::new(RequestPipeline::with_client(
        Client::new(),
        &server.url(),
        credentials.clone(),
        notifier.clone(),
    ));
    let sessions = Arc::new(SessionRepository::new(pipeline.clone(), credentials.clone()));
    let machine = Arc::new(AuthStateMachine::new(sessions, credentials.clone()));

    Stack {
        backend,
        credentials,
        notifier,
        pipeline,
        machine,
    }
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh() {
    let mut server = Server::new_async().await;
    let mut stale = Vec::new();
    for path in ["/projects/", "/tasks/", "/documents/"] {
        stale.push(
            server
                .mock("GET", path)
                .match_header("authorization", "Bearer A1")
                .with_status(401)
                .with_body(r#"{"detail": "Given token not valid for any token type"}"#)
                .expect(1)
                .create_async()
                .await,
        );
    }
    let refresh = server
        .mock("POST", "/auth/refresh/")
        .match_body(Matcher::Json(json!({"refresh": "R1"})))
        .with_status(200)
        .with_body(r#"{"access": "A2"}"#)
        .expect(1)
        .create_async()
        .await;
    let projects = server
        .mock("GET", "/projects/")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .with_body(r#"[{"id": 1, "name": "Lakeview Villa"}]"#)
        .expect(1)
        .create_async()
        .await;
    let tasks = server
        .mock("GET", "/tasks/")
        .match_header("authorization", "Bearer A2")
        .with_status(404)
        .with_body(r#"{"detail": "Not found."}"#)
        .expect(1)
        .create_async()
        .await;
    let documents = server
        .mock("GET", "/documents/")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    let results = join_all(
        ["projects", "tasks", "documents"]
            .into_iter()
            .map(|path| s.pipeline.execute(ApiRequest::get(path))),
    )
    .await;

    let projects_body: Value = results[0].as_ref().unwrap().json().unwrap();
    assert_eq!(projects_body[0]["name"], "Lakeview Villa");
    assert!(matches!(results[1], Err(ApiError::NotFound(_))));
    assert!(results[2].as_ref().unwrap().json::<Vec<Value>>().unwrap().is_empty());

    for mock in &stale {
        mock.assert_async().await;
    }
    refresh.assert_async().await;
    projects.assert_async().await;
    tasks.assert_async().await;
    documents.assert_async().await;

    // New access token persisted, refresh token kept since the server didn't rotate it
    assert_eq!(s.backend.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("A2"));
    assert_eq!(s.backend.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
    assert_eq!(s.notifier.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_401s_on_worker_threads_refresh_once() {
    const N: usize = 16;

    let mut server = Server::new_async().await;
    let stale = server
        .mock("GET", "/projects/")
        .match_header("authorization", "Bearer A1")
        .with_status(401)
        .expect(N)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh/")
        .with_status(200)
        .with_body(r#"{"access": "A2", "refresh": "R2"}"#)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/projects/")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .with_body("[]")
        .expect(N)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    let handles: Vec<_> = (0..N)
        .map(|_| {
            let pipeline = s.pipeline.clone();
            tokio::spawn(async move { pipeline.execute(ApiRequest::get("projects")).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    stale.assert_async().await;
    refresh.assert_async().await;
    fresh.assert_async().await;
}

#[tokio::test]
async fn invalid_refresh_fails_everyone_and_notifies_once() {
    let mut server = Server::new_async().await;
    for path in ["/projects/", "/tasks/", "/clients/", "/invoices/"] {
        server
            .mock("GET", path)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
    }
    let refresh = server
        .mock("POST", "/auth/refresh/")
        .with_status(401)
        .with_body(r#"{"detail": "Token is blacklisted", "code": "token_not_valid"}"#)
        .expect(1)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    let results = join_all(
        ["projects", "tasks", "clients", "invoices"]
            .into_iter()
            .map(|path| s.pipeline.execute(ApiRequest::get(path))),
    )
    .await;

    assert!(results.iter().all(|r| matches!(r, Err(ApiError::Unauthorized))));
    refresh.assert_async().await;
    assert_eq!(s.notifier.count(), 1);
    assert!(s.credentials.current().is_empty());
    assert_eq!(s.backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(s.backend.get(REFRESH_TOKEN_KEY).unwrap(), None);
}

#[tokio::test]
async fn bootstrap_recovers_through_refresh() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/auth/me/")
        .match_header("authorization", "Bearer A1")
        .with_status(401)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh/")
        .with_status(200)
        .with_body(r#"{"access": "A2"}"#)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/auth/me/")
        .match_header("authorization", "Bearer A2")
        .with_status(200)
        .with_body(PROFILE)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    let state = s.machine.bootstrap().await;

    let session = state.session().expect("authenticated");
    assert_eq!(session.user.full_name, "Meera Iyer");
    assert!(session.can("projects"));
    assert!(!session.can("finance"));
    assert!(!session.can("docs"));
    refresh.assert_async().await;
}

#[tokio::test]
async fn sign_out_then_bootstrap_needs_no_network() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/auth/me/")
        .with_status(200)
        .with_body(PROFILE)
        .expect(1)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    assert!(s.machine.bootstrap().await.is_authenticated());

    s.machine.sign_out();
    assert_eq!(s.machine.current_state(), AuthState::Unauthenticated(None));
    assert_eq!(s.backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(s.backend.get(REFRESH_TOKEN_KEY).unwrap(), None);

    // A fresh process over the same storage
    let mut fresh_server = Server::new_async().await;
    let any = fresh_server
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let credentials = Arc::new(CredentialStore::new(Box::new(s.backend.clone())));
    let pipeline = Arc::new(RequestPipeline::with_client(
        Client::new(),
        &fresh_server.url(),
        credentials.clone(),
        UnauthorizedNotifier::new(),
    ));
    let machine = AuthStateMachine::new(
        Arc::new(SessionRepository::new(pipeline, credentials.clone())),
        credentials,
    );

    assert_eq!(machine.bootstrap().await, AuthState::Unauthenticated(None));
    any.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sign_out_during_refresh_keeps_tokens_cleared() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/projects/")
        .match_header("authorization", "Bearer A1")
        .with_status(401)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_millis(500));
            w.write_all(br#"{"access": "A2", "refresh": "R2"}"#)
        })
        .expect(1)
        .create_async()
        .await;
    let retried = server
        .mock("GET", "/projects/")
        .match_header("authorization", "Bearer A2")
        .expect(0)
        .create_async()
        .await;

    let s = stack(&server, Some(("A1", "R1")));
    let pipeline = s.pipeline.clone();
    let request = tokio::spawn(async move { pipeline.execute(ApiRequest::get("projects")).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    s.machine.sign_out();

    let result = request.await.unwrap();
    assert!(matches!(result, Err(ApiError::Unauthorized)));
    refresh.assert_async().await;
    retried.assert_async().await;

    assert_eq!(s.machine.current_state(), AuthState::Unauthenticated(None));
    assert!(s.credentials.current().is_empty());
    assert_eq!(s.backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(s.backend.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(s.notifier.count(), 0);

    // The next start finds nothing to restore
    let mut fresh_server = Server::new_async().await;
    let any = fresh_server
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let credentials = Arc::new(CredentialStore::new(Box::new(s.backend.clone())));
    let pipeline = Arc::new(RequestPipeline::with_client(
        Client::new(),
        &fresh_server.url(),
        credentials.clone(),
        UnauthorizedNotifier::new(),
    ));
    let machine = AuthStateMachine::new(
        Arc::new(SessionRepository::new(pipeline, credentials.clone())),
        credentials,
    );
    assert_eq!(machine.bootstrap().await, AuthState::Unauthenticated(None));
    any.assert_async().await;
}

#[tokio::test]
async fn rejected_sign_in_shows_fixed_message_and_stores_nothing() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/auth/token/")
        .match_body(Matcher::Json(json!({"username": "bob", "password": "wrong"})))
        .with_status(401)
        .with_body(r#"{"detail": "No active account found with the given credentials"}"#)
        .create_async()
        .await;

    let s = stack(&server, None);
    let state = s.machine.sign_in("bob", "wrong").await;

    assert_eq!(
        state,
        AuthState::Unauthenticated(Some(SIGN_IN_FAILED_MESSAGE.to_string()))
    );
    assert_eq!(s.backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(s.backend.get(REFRESH_TOKEN_KEY).unwrap(), None);
}
