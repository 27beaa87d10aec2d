use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module keys the server resolves permissions for.
pub const MODULE_KEYS: [&str; 10] = [
    "clients",
    "leads",
    "projects",
    "site_visits",
    "finance",
    "invoices",
    "docs",
    "team",
    "users",
    "settings",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub role: String,
}

/// The signed-in user and their resolved permission map.
///
/// Never mutated after construction; a refresh produces a new `Session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: User,
    pub permissions: HashMap<String, bool>,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub fetched_at: DateTime<Utc>,
}

impl Session {
    pub fn from_profile(profile: ProfileResponse) -> Self {
        let permissions = profile
            .permissions
            .into_iter()
            .map(|(module, value)| {
                let granted = matches!(value, Value::Bool(true));
                (module, granted)
            })
            .collect();

        Self {
            user: profile.user.into_user(),
            permissions,
            fetched_at: Utc::now(),
        }
    }

    /// Whether the user may access `module`. Unknown modules are denied.
    pub fn can(&self, module: &str) -> bool {
        self.permissions.get(module).copied().unwrap_or(false)
    }

    /// Granted module keys, sorted.
    pub fn granted_modules(&self) -> Vec<&str> {
        let mut granted: Vec<&str> = self
            .permissions
            .iter()
            .filter(|(_, granted)| **granted)
            .map(|(module, _)| module.as_str())
            .collect();
        granted.sort_unstable();
        granted
    }
}

/// Raw `auth/me/` payload.
#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    pub user: ProfileUser,
    #[serde(default)]
    pub permissions: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileUser {
    pub id: i64,
    pub username: String,
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl ProfileUser {
    fn display_name(&self) -> String {
        if let Some(full) = self.full_name.as_deref().map(str::trim) {
            if !full.is_empty() {
                return full.to_string();
            }
        }
        let joined = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let joined = joined.trim();
        if joined.is_empty() {
            self.username.clone()
        } else {
            joined.to_string()
        }
    }

    fn into_user(self) -> User {
        User {
            full_name: self.display_name(),
            id: self.id,
            username: self.username,
            email: self.email.unwrap_or_default(),
            role: self.role.unwrap_or_default(),
        }
    }
}
