use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiRequest, RefreshError, RequestPipeline};
use crate::models::{ProfileResponse, Session};

use super::CredentialStore;

/// Token endpoint (username/password login)
const TOKEN_PATH: &str = "auth/token/";

/// Profile + permissions endpoint
const PROFILE_PATH: &str = "auth/me/";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("No refresh token stored")]
    NoRefreshToken,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(RefreshError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Credential storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<RefreshError> for AuthError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NoRefreshToken => AuthError::NoRefreshToken,
            other => AuthError::RefreshFailed(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    refresh: String,
}

/// Performs the authentication calls and maps the profile into a [`Session`].
pub struct SessionRepository {
    pipeline: Arc<RequestPipeline>,
    credentials: Arc<CredentialStore>,
}

impl SessionRepository {
    pub fn new(pipeline: Arc<RequestPipeline>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            pipeline,
            credentials,
        }
    }

    /// Log in, persist the returned token pair, then load the session.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let request = ApiRequest::post(
            TOKEN_PATH,
            json!({ "username": username, "password": password }),
        )
        .auth_endpoint();

        let response = match self.pipeline.execute(request).await {
            Ok(response) => response,
            Err(ApiError::Unauthorized) | Err(ApiError::Validation { .. }) => {
                info!(username = username, "Login rejected");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        let tokens: TokenResponse = response.json()?;
        self.credentials
            .replace(&tokens.access, &tokens.refresh)
            .map_err(AuthError::Storage)?;
        debug!(username = username, "Token pair stored");

        match self.fetch_session().await {
            Ok(session) => Ok(session),
            Err(e) => {
                // Don't leave tokens behind for a sign-in that didn't complete
                if let Err(clear_err) = self.credentials.clear() {
                    warn!(error = %clear_err, "Failed to clear credentials after profile fetch failure");
                }
                Err(e)
            }
        }
    }

    /// Exchange the refresh token for a new access token, then load the session.
    ///
    /// Fails with `NoRefreshToken` without touching the network when no
    /// refresh token is stored.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        if self.credentials.current().refresh.is_none() {
            return Err(AuthError::NoRefreshToken);
        }
        self.pipeline.refresh_tokens().await?;
        self.fetch_session().await
    }

    /// Fetch the profile and permission map for the current access token.
    pub async fn fetch_session(&self) -> Result<Session, AuthError> {
        let profile: ProfileResponse = self.pipeline.get_json(PROFILE_PATH).await?;
        let session = Session::from_profile(profile);
        debug!(
            user_id = session.user.id,
            role = %session.user.role,
            granted = session.granted_modules().len(),
            "Session loaded"
        );
        Ok(session)
    }

    /// Forget the stored tokens. Best effort: storage errors are logged, never returned.
    pub fn sign_out(&self) {
        if let Err(e) = self.credentials.clear() {
            warn!(error = %e, "Failed to clear stored credentials during sign-out");
        }
        info!("Signed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryBackend, UnauthorizedNotifier};
    use mockito::{Matcher, Server};
    use reqwest::Client;

    const PROFILE: &str = r#"{
        "user": {"id": 3, "username": "asha", "full_name": "Asha Rao", "email": "asha@studio.test", "role": "architect"},
        "permissions": {"projects": true, "finance": false}
    }"#;

    fn repository(server: &Server) -> (SessionRepository, Arc<CredentialStore>) {
        let credentials = Arc::new(CredentialStore::new(Box::new(MemoryBackend::new())));
        let pipeline = Arc::new(RequestPipeline::with_client(
            Client::new(),
            &server.url(),
            credentials.clone(),
            UnauthorizedNotifier::new(),
        ));
        (SessionRepository::new(pipeline, credentials.clone()), credentials)
    }

    #[tokio::test]
    async fn test_authenticate_persists_tokens_and_loads_session() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/auth/token/")
            .match_body(Matcher::Json(json!({"username": "asha", "password": "pw"})))
            .with_status(200)
            .with_body(r#"{"access": "A1", "refresh": "R1"}"#)
            .create_async()
            .await;
        let me = server
            .mock("GET", "/auth/me/")
            .match_header("authorization", "Bearer A1")
            .with_status(200)
            .with_body(PROFILE)
            .create_async()
            .await;

        let (repo, credentials) = repository(&server);
        let session = repo.authenticate("asha", "pw").await.unwrap();

        assert_eq!(session.user.username, "asha");
        assert!(session.can("projects"));
        assert_eq!(credentials.current().access.as_deref(), Some("A1"));
        assert_eq!(credentials.current().refresh.as_deref(), Some("R1"));
        login.assert_async().await;
        me.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_login_writes_nothing() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/token/")
            .with_status(401)
            .with_body(r#"{"detail": "No active account found with the given credentials"}"#)
            .create_async()
            .await;
        let me = server.mock("GET", "/auth/me/").expect(0).create_async().await;

        let (repo, credentials) = repository(&server);
        let err = repo.authenticate("bob", "wrong").await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(credentials.current().is_empty());
        me.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_server_error_is_not_invalid_credentials() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/token/")
            .with_status(503)
            .create_async()
            .await;

        let (repo, _) = repository(&server);
        let err = repo.authenticate("asha", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Api(ApiError::ServerError { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_failed_profile_after_login_clears_tokens() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/token/")
            .with_status(200)
            .with_body(r#"{"access": "A1", "refresh": "R1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/auth/me/")
            .with_status(500)
            .create_async()
            .await;

        let (repo, credentials) = repository(&server);
        assert!(repo.authenticate("asha", "pw").await.is_err());
        assert!(credentials.current().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_token_makes_no_call() {
        let mut server = Server::new_async().await;
        let refresh = server.mock("POST", "/auth/refresh/").expect(0).create_async().await;

        let (repo, credentials) = repository(&server);
        credentials.save(Some("A1"), None).unwrap();

        assert!(matches!(repo.refresh().await, Err(AuthError::NoRefreshToken)));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_loads_session() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/refresh/")
            .match_body(Matcher::Json(json!({"refresh": "R1"})))
            .with_status(200)
            .with_body(r#"{"access": "A2", "refresh": "R2"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/auth/me/")
            .match_header("authorization", "Bearer A2")
            .with_status(200)
            .with_body(PROFILE)
            .create_async()
            .await;

        let (repo, credentials) = repository(&server);
        credentials.save(Some("A1"), Some("R1")).unwrap();

        let session = repo.refresh().await.unwrap();
        assert_eq!(session.user.full_name, "Asha Rao");
        assert_eq!(credentials.current().refresh.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_refresh_rejected_maps_to_refresh_failed() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/refresh/")
            .with_status(401)
            .create_async()
            .await;

        let (repo, credentials) = repository(&server);
        credentials.save(Some("A1"), Some("R1")).unwrap();

        let err = repo.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(RefreshError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_malformed_profile_is_invalid_response() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/auth/me/")
            .with_status(200)
            .with_body(r#"{"permissions": {}}"#)
            .create_async()
            .await;

        let (repo, credentials) = repository(&server);
        credentials.save(Some("A1"), Some("R1")).unwrap();

        let err = repo.fetch_session().await.unwrap_err();
        assert!(matches!(err, AuthError::Api(ApiError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_sign_out_clears_credentials() {
        let server = Server::new_async().await;
        let (repo, credentials) = repository(&server);
        credentials.save(Some("A1"), Some("R1")).unwrap();

        repo.sign_out();
        assert!(credentials.current().is_empty());
    }
}
