//! StudioFlow mobile client core.
//!
//! The authenticated request layer for the StudioFlow business API: token
//! storage, a request pipeline that refreshes expired tokens transparently,
//! and the session state machine the rest of the app is gated on.
//!
//! Build everything through [`AppContext`]; resource screens only need
//! [`AppContext::pipeline`] and [`AppContext::auth`].

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiError, ApiRequest, ApiResponse, RequestPipeline};
pub use app::AppContext;
pub use auth::{AuthError, AuthState, AuthStateMachine, CredentialStore, SessionRepository};
pub use config::Config;
pub use models::{Session, User};
