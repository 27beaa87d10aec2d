//! Passphrase-encrypted secret file for hosts without an OS keychain.
//!
//! The file is JSON: a random salt, the nonce of the last write, and the
//! ChaCha20-Poly1305 ciphertext of a `key -> secret` map. The key is derived
//! from the passphrase with Argon2 once, when the vault is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::SecretBackend;

/// Vault file name in cache directory
pub const VAULT_FILE: &str = "credentials.vault";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct VaultFile {
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

pub struct EncryptedFileBackend {
    path: PathBuf,
    salt: [u8; SALT_LEN],
    key: [u8; KEY_LEN],
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl EncryptedFileBackend {
    /// Open (or prepare to create) the vault at `path`.
    ///
    /// An existing vault keeps its salt, so the passphrase must match the one
    /// it was written with; that is checked by decrypting it immediately.
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let path = path.into();
        if passphrase.is_empty() {
            return Err(anyhow!("Vault passphrase must not be empty"));
        }

        let existing = Self::read_file(&path)?;
        let salt: [u8; SALT_LEN] = match existing {
            Some(ref file) => file
                .salt
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Vault file has a malformed salt"))?,
            None => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                salt
            }
        };

        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive vault key: {}", e))?;

        let backend = Self {
            path,
            salt,
            key,
            lock: Mutex::new(()),
        };
        if let Some(file) = existing {
            backend.decrypt(&file)?;
        }
        debug!(path = ?backend.path, "Credential vault opened");
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Result<Option<VaultFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).context("Failed to read vault file")?;
        let file = serde_json::from_str(&contents).context("Failed to parse vault file")?;
        Ok(Some(file))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    fn decrypt(&self, file: &VaultFile) -> Result<HashMap<String, String>> {
        if file.nonce.len() != NONCE_LEN {
            return Err(anyhow!("Vault file has a malformed nonce"));
        }
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&file.nonce), file.ciphertext.as_slice())
            .map_err(|_| anyhow!("Failed to decrypt vault - wrong passphrase or corrupted file"))?;
        serde_json::from_slice(&plaintext).context("Failed to parse decrypted vault contents")
    }

    fn load_entries(&self) -> Result<HashMap<String, String>> {
        match Self::read_file(&self.path)? {
            Some(file) => self.decrypt(&file),
            None => Ok(HashMap::new()),
        }
    }

    fn store_entries(&self, entries: &HashMap<String, String>) -> Result<()> {
        let plaintext = serde_json::to_vec(entries)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| anyhow!("Failed to encrypt vault contents"))?;
        let file = VaultFile {
            salt: self.salt.to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&file)?).context("Failed to write vault file")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace vault file")?;
        Ok(())
    }

    fn modify<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let _guard = self.lock.lock().map_err(|_| anyhow!("Vault lock poisoned"))?;
        let mut entries = self.load_entries()?;
        change(&mut entries);
        self.store_entries(&entries)
    }
}

impl SecretBackend for EncryptedFileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("Vault lock poisoned"))?;
        Ok(self.load_entries()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}
