//! Data models for the signed-in user.
//!
//! - `User`, `Session`: profile plus resolved permission map from `auth/me/`
//! - `MODULE_KEYS`: the permission keys the server resolves

pub mod session;

pub use session::{ProfileResponse, Session, User, MODULE_KEYS};
