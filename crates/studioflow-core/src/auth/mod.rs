//! Authentication module for managing credentials and the user session.
//!
//! This module provides:
//! - `CredentialStore`: the access/refresh token pair in secure storage, with
//!   an in-memory mirror for the request path
//! - `SessionRepository`: login, refresh and profile calls
//! - `AuthStateMachine`: the observable session state the app is gated on
//! - `UnauthorizedNotifier`: the pipeline's "session expired" channel
//!
//! Sessions are never written to disk; only the two tokens are.

pub mod credentials;
pub mod notifier;
pub mod session;
pub mod state;
pub mod vault;

pub use credentials::{
    CredentialStore, Credentials, KeyringBackend, MemoryBackend, SecretBackend, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
pub use notifier::{UnauthorizedEvent, UnauthorizedListener, UnauthorizedNotifier};
pub use session::{AuthError, SessionRepository};
pub use state::{AuthState, AuthStateMachine, SubscriptionId, SIGN_IN_FAILED_MESSAGE};
pub use vault::{EncryptedFileBackend, VAULT_FILE};
