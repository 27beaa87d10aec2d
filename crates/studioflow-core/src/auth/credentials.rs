use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use tracing::{debug, warn};

const SERVICE_NAME: &str = "studioflow";

/// Durable key under which the access token is stored
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Durable key under which the refresh token is stored
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// The bearer/refresh pair. Both are opaque strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }
}

/// Durable secret storage addressed by key.
pub trait SecretBackend: Send + Sync {
    /// Read a secret. A missing entry is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a secret. Removing a missing entry succeeds.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Secrets in the OS keychain
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

/// In-process secrets, for tests and embedders that manage persistence themselves.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Memory secret store lock poisoned"))
    }
}

impl SecretBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// Token storage with a synchronous in-memory mirror.
///
/// `current()` only reads the mirror, so it is safe on the hot request path.
/// Writers are serialized, and the mirror is swapped as a whole pair so a
/// reader never sees a half-written update.
///
/// The epoch identifies the session the stored pair belongs to. It moves on
/// when the pair is cleared or replaced by a fresh login, so work started for
/// an older session can tell it must not write back.
pub struct CredentialStore {
    backend: Box<dyn SecretBackend>,
    mirror: RwLock<Credentials>,
    epoch: AtomicU64,
    writer: Mutex<()>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn SecretBackend>) -> Self {
        Self {
            backend,
            mirror: RwLock::new(Credentials::default()),
            epoch: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Read durable storage into memory. Called once at startup.
    pub fn load(&self) -> Result<Credentials> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let loaded = Credentials {
            access: self.backend.get(ACCESS_TOKEN_KEY)?,
            refresh: self.backend.get(REFRESH_TOKEN_KEY)?,
        };
        debug!(
            has_access = loaded.access.is_some(),
            has_refresh = loaded.refresh.is_some(),
            "Credentials loaded"
        );
        self.replace_mirror(loaded.clone());
        Ok(loaded)
    }

    /// Current session epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Persist the provided fields; `None` leaves that field untouched.
    ///
    /// On error the mirror keeps the last successfully saved pair.
    pub fn save(&self, access: Option<&str>, refresh: Option<&str>) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_pair(access, refresh)
    }

    /// Like [`Self::save`], but only while `epoch` is still current.
    ///
    /// Returns `Ok(false)` without writing anything if the pair was cleared or
    /// replaced since `epoch` was read.
    pub fn save_if_current(
        &self,
        epoch: u64,
        access: Option<&str>,
        refresh: Option<&str>,
    ) -> Result<bool> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch() != epoch {
            debug!(epoch, current = self.epoch(), "Discarding credentials from a superseded session");
            return Ok(false);
        }
        self.write_pair(access, refresh)?;
        Ok(true)
    }

    /// Store the pair of a new login, superseding anything in flight for the
    /// previous session.
    pub fn replace(&self, access: &str, refresh: &str) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.write_pair(Some(access), Some(refresh))
    }

    /// Remove both secrets.
    ///
    /// Memory is always emptied; the first durable delete error is returned.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear_locked()
    }

    /// Clear only while `epoch` is still current. `Ok(false)` means the pair
    /// already belongs to another session and was left alone.
    pub fn clear_if_current(&self, epoch: u64) -> Result<bool> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.epoch() != epoch {
            return Ok(false);
        }
        self.clear_locked()?;
        Ok(true)
    }

    /// Memory-only snapshot of the current pair.
    pub fn current(&self) -> Credentials {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Callers hold `writer`.
    fn write_pair(&self, access: Option<&str>, refresh: Option<&str>) -> Result<()> {
        let previous = self.current();

        // Refresh first: a failure between the two writes must never leave a
        // new access token next to a refresh token the server already rotated.
        if let Some(refresh) = refresh {
            self.backend.set(REFRESH_TOKEN_KEY, refresh)?;
        }
        if let Some(access) = access {
            if let Err(e) = self.backend.set(ACCESS_TOKEN_KEY, access) {
                if refresh.is_some() {
                    self.restore_refresh(previous.refresh.as_deref());
                }
                return Err(e);
            }
        }

        let mut next = previous;
        if let Some(access) = access {
            next.access = Some(access.to_string());
        }
        if let Some(refresh) = refresh {
            next.refresh = Some(refresh.to_string());
        }
        self.replace_mirror(next);
        debug!(
            access_updated = access.is_some(),
            refresh_updated = refresh.is_some(),
            "Credentials saved"
        );
        Ok(())
    }

    fn restore_refresh(&self, previous: Option<&str>) {
        let restored = match previous {
            Some(refresh) => self.backend.set(REFRESH_TOKEN_KEY, refresh),
            None => self.backend.delete(REFRESH_TOKEN_KEY),
        };
        if let Err(e) = restored {
            warn!(error = %e, "Failed to roll back refresh token after partial save");
        }
    }

    // Callers hold `writer`.
    fn clear_locked(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.replace_mirror(Credentials::default());

        let access = self.backend.delete(ACCESS_TOKEN_KEY);
        let refresh = self.backend.delete(REFRESH_TOKEN_KEY);
        if let Err(ref e) = access {
            warn!(error = %e, "Failed to delete access token");
        }
        if let Err(ref e) = refresh {
            warn!(error = %e, "Failed to delete refresh token");
        }
        access.and(refresh)?;
        debug!("Credentials cleared");
        Ok(())
    }

    fn replace_mirror(&self, credentials: Credentials) {
        *self.mirror.write().unwrap_or_else(PoisonError::into_inner) = credentials;
    }
}
