use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation failed ({status}): {message}")]
    Validation {
        status: u16,
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut cut = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => {
                let fields = Self::field_errors(body);
                let message = Self::summarize_fields(&fields).unwrap_or(truncated);
                ApiError::Validation {
                    status: status.as_u16(),
                    message,
                    fields,
                }
            }
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError {
                status: code,
                message: truncated,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Status code carried by this error, if it came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            ApiError::Unauthorized => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::Validation { status, .. } => Some(*status),
            ApiError::RateLimited => Some(429),
            ApiError::ServerError { status, .. } => Some(*status),
            ApiError::InvalidResponse(_) => None,
        }
    }

    /// Timeouts and connection failures; the caller may safely retry these.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// Parse a field-error body of the form `{"field": ["msg", ...], "detail": "msg"}`.
    /// Anything that isn't a JSON object yields an empty map.
    fn field_errors(body: &str) -> BTreeMap<String, Vec<String>> {
        let mut fields = BTreeMap::new();
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
            return fields;
        };

        for (field, value) in map {
            let messages: Vec<String> = match value {
                Value::String(s) => vec![s],
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
                Value::Null => continue,
                other => vec![other.to_string()],
            };
            if !messages.is_empty() {
                fields.insert(field, messages);
            }
        }
        fields
    }

    fn summarize_fields(fields: &BTreeMap<String, Vec<String>>) -> Option<String> {
        if fields.is_empty() {
            return None;
        }
        let parts: Vec<String> = fields
            .iter()
            .map(|(field, messages)| match field.as_str() {
                "detail" | "non_field_errors" => messages.join(" "),
                _ => format!("{}: {}", field, messages.join(" ")),
            })
            .collect();
        Some(parts.join("; "))
    }
}
