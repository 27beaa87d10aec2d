//! Request and response values passed through the [`RequestPipeline`].
//!
//! [`RequestPipeline`]: super::RequestPipeline

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::ApiError;

/// A single API call, described independently of the HTTP client.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    auth_endpoint: bool,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: normalize_path(path),
            query: Vec::new(),
            body: None,
            auth_endpoint: false,
            retried: false,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: &str, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn patch(path: &str, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Mark this as a login/refresh call: no bearer token is attached and a
    /// 401 is returned as-is instead of triggering a refresh.
    pub fn auth_endpoint(mut self) -> Self {
        self.auth_endpoint = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn is_auth_endpoint(&self) -> bool {
        self.auth_endpoint
    }

    /// Whether this request has already been resubmitted after a refresh.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Copy of this request with the retry marker set.
    pub(crate) fn as_retry(&self) -> Self {
        Self {
            retried: true,
            ..self.clone()
        }
    }
}

/// Normalize a resource path to the server's trailing-slash convention.
///
/// `projects` and `/projects` both become `projects/`; an embedded query string
/// is preserved after the slash.
pub fn normalize_path(path: &str) -> String {
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let trimmed = path.trim_matches('/');

    let mut normalized = if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }

    /// True for `204 No Content` and other empty bodies.
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}
