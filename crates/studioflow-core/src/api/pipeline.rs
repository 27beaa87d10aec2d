//! Authenticated request pipeline for the StudioFlow REST API.
//!
//! Every resource call goes through [`RequestPipeline::execute`]. A 401 on a
//! non-auth request that has not been retried yet starts (or joins) the single
//! shared token refresh, then resubmits the request once with the new token.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, UnauthorizedNotifier};
use crate::config::Config;

use super::{ApiError, ApiRequest, ApiResponse};

// ============================================================================
// Constants
// ============================================================================

/// Token refresh endpoint, relative to the API base URL
const REFRESH_PATH: &str = "auth/refresh/";

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Why the shared refresh operation failed.
///
/// Cloneable so every caller waiting on the same refresh receives the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token stored")]
    NoRefreshToken,

    #[error("Refresh rejected: {0}")]
    Rejected(String),

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Failed to persist refreshed token: {0}")]
    Storage(String),

    /// The session was signed out or replaced while the refresh was in flight.
    #[error("Session changed during refresh")]
    Superseded,
}

impl RefreshError {
    /// The stored credentials can never be refreshed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::NoRefreshToken | RefreshError::Rejected(_))
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

struct InFlightRefresh {
    id: u64,
    outcome: SharedRefresh,
}

/// Base URL plus pooled HTTP client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
struct Transport {
    client: Client,
    base_url: String,
}

impl Transport {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut builder = self
            .client
            .request(request.method().clone(), self.url(request.path()))
            .header(header::ACCEPT, "application/json");

        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }
}

pub struct RequestPipeline {
    transport: Transport,
    credentials: Arc<CredentialStore>,
    notifier: UnauthorizedNotifier,
    refresh_slot: Arc<Mutex<Option<InFlightRefresh>>>,
    refresh_seq: AtomicU64,
}

impl RequestPipeline {
    /// Create a pipeline using the timeouts and base URL from `config`
    pub fn new(
        config: &Config,
        credentials: Arc<CredentialStore>,
        notifier: UnauthorizedNotifier,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self::with_client(
            client,
            &config.base_url,
            credentials,
            notifier,
        ))
    }

    /// Create a pipeline around an existing client, sharing its connection pool.
    pub fn with_client(
        client: Client,
        base_url: &str,
        credentials: Arc<CredentialStore>,
        notifier: UnauthorizedNotifier,
    ) -> Self {
        Self {
            transport: Transport {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
            },
            credentials,
            notifier,
            refresh_slot: Arc::new(Mutex::new(None)),
            refresh_seq: AtomicU64::new(0),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.transport.base_url
    }

    /// Channel on which terminal refresh failures are published
    pub fn notifier(&self) -> &UnauthorizedNotifier {
        &self.notifier
    }

    /// Execute a request, transparently recovering from one expired access token.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_with = if request.is_auth_endpoint() {
            None
        } else {
            self.credentials.current().access
        };

        let response = self.transport.send(&request, sent_with.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED
            || request.is_auth_endpoint()
            || request.is_retried()
        {
            return Self::check_response(response).await;
        }

        debug!(
            method = %request.method(),
            path = request.path(),
            "Received 401, attempting token recovery"
        );

        let Some(token) = self.recover_access_token(sent_with.as_deref()).await else {
            return Self::check_response(response).await;
        };

        let retry = request.as_retry();
        debug!(method = %retry.method(), path = retry.path(), "Resubmitting request with refreshed token");
        let response = self.transport.send(&retry, Some(&token)).await?;
        Self::check_response(response).await
    }

    /// Refresh the token pair, joining the refresh already in flight if any.
    ///
    /// Returns the new access token once it has been persisted.
    pub async fn refresh_tokens(&self) -> Result<String, RefreshError> {
        let outcome = {
            let mut slot = self.refresh_slot.lock().await;
            self.join_or_start_refresh(&mut slot)
        };
        outcome.await
    }

    /// Token to retry a 401'd request with, or `None` if the 401 must stand.
    ///
    /// The credential checks happen under the slot lock: a finished refresh
    /// updates the credentials before it vacates the slot, so a late 401 either
    /// joins the settled refresh or sees its result here.
    async fn recover_access_token(&self, sent_with: Option<&str>) -> Option<String> {
        let outcome = {
            let mut slot = self.refresh_slot.lock().await;
            if slot.is_none() {
                match self.credentials.current().access {
                    None => {
                        debug!("No access token stored, not refreshing");
                        return None;
                    }
                    Some(current) if sent_with != Some(current.as_str()) => {
                        debug!("Access token changed since dispatch, retrying with current token");
                        return Some(current);
                    }
                    Some(_) => {}
                }
            }
            self.join_or_start_refresh(&mut slot)
        };

        match outcome.await {
            Ok(token) => Some(self.credentials.current().access.unwrap_or(token)),
            Err(e) => {
                debug!(error = %e, "Token recovery failed, returning original 401");
                None
            }
        }
    }

    fn join_or_start_refresh(&self, slot: &mut Option<InFlightRefresh>) -> SharedRefresh {
        if let Some(inflight) = slot.as_ref() {
            debug!(refresh_id = inflight.id, "Joining in-flight token refresh");
            return inflight.outcome.clone();
        }

        let id = self.refresh_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = self.refresh_operation(id).boxed().shared();
        *slot = Some(InFlightRefresh {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn refresh_operation(
        &self,
        id: u64,
    ) -> impl Future<Output = Result<String, RefreshError>> + Send + 'static {
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        let notifier = self.notifier.clone();
        let slot = self.refresh_slot.clone();

        async move {
            info!(refresh_id = id, "Refreshing access token");
            let epoch = credentials.epoch();
            let had_credentials = !credentials.current().is_empty();
            let result = exchange_refresh_token(&transport, &credentials, epoch).await;

            let terminal = matches!(result, Err(ref e) if e.is_terminal());
            let expired = terminal
                && match credentials.clear_if_current(epoch) {
                    Ok(cleared) => cleared,
                    Err(e) => {
                        warn!(error = %e, "Failed to clear credentials after refresh failure");
                        true
                    }
                };

            {
                let mut slot = slot.lock().await;
                if slot.as_ref().map(|inflight| inflight.id) == Some(id) {
                    *slot = None;
                }
            }

            match &result {
                Ok(_) => info!(refresh_id = id, "Access token refreshed"),
                Err(e) if expired => {
                    warn!(refresh_id = id, error = %e, "Token refresh failed, session expired");
                    if had_credentials {
                        notifier.notify(epoch);
                    }
                }
                Err(RefreshError::Superseded) => {
                    info!(refresh_id = id, "Session changed during refresh, discarding new tokens")
                }
                Err(e) if terminal => {
                    info!(refresh_id = id, error = %e, "Token refresh failed for a session that has already ended")
                }
                Err(e) => warn!(refresh_id = id, error = %e, "Token refresh failed, keeping credentials"),
            }
            result
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<ApiResponse, ApiError> {
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            Ok(ApiResponse { status, body })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Convenience methods for resource screens =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.execute(ApiRequest::post(path, body)).await?.json()
    }

    pub async fn patch_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.execute(ApiRequest::patch(path, body)).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(path)).await.map(|_| ())
    }
}

/// POST the stored refresh token and persist the returned pair, unless the
/// session at `epoch` has been signed out or replaced in the meantime.
async fn exchange_refresh_token(
    transport: &Transport,
    credentials: &CredentialStore,
    epoch: u64,
) -> Result<String, RefreshError> {
    let refresh = credentials
        .current()
        .refresh
        .ok_or(RefreshError::NoRefreshToken)?;

    let request = ApiRequest::post(REFRESH_PATH, json!({ "refresh": refresh })).auth_endpoint();
    let response = transport
        .send(&request, None)
        .await
        .map_err(|e| RefreshError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RefreshError::Rejected(format!("status {}", status)));
    }

    let body = response
        .text()
        .await
        .map_err(|e| RefreshError::Network(e.to_string()))?;
    let tokens: RefreshResponse = serde_json::from_str(&body)
        .map_err(|e| RefreshError::Rejected(format!("malformed refresh response: {}", e)))?;

    let saved = credentials
        .save_if_current(epoch, Some(&tokens.access), tokens.refresh.as_deref())
        .map_err(|e| RefreshError::Storage(e.to_string()))?;
    if !saved {
        return Err(RefreshError::Superseded);
    }
    Ok(tokens.access)
}
