//! REST API client module for the StudioFlow service.
//!
//! This module provides the `RequestPipeline` that every API call goes
//! through. It attaches the current bearer token, and when a request comes
//! back 401 it refreshes the token pair once (shared by all concurrent
//! callers) and resubmits the request a single time.
//!
//! Login and refresh calls are flagged as auth-endpoint requests and are never
//! intercepted.

pub mod error;
pub mod pipeline;
pub mod request;

pub use error::ApiError;
pub use pipeline::{RefreshError, RequestPipeline};
pub use request::{normalize_path, ApiRequest, ApiResponse};
