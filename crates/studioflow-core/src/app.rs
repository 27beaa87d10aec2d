//! Process-level wiring.
//!
//! `AppContext` builds the auth stack once at startup, in dependency order:
//! CredentialStore → RequestPipeline → SessionRepository → AuthStateMachine.
//! Nothing here is global; drop the context (or call `shutdown`) at exit.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::RequestPipeline;
use crate::auth::{
    AuthState, AuthStateMachine, CredentialStore, EncryptedFileBackend, KeyringBackend,
    SecretBackend, SessionRepository, UnauthorizedNotifier, VAULT_FILE,
};
use crate::config::{Config, CredentialBackendKind};

pub struct AppContext {
    credentials: Arc<CredentialStore>,
    pipeline: Arc<RequestPipeline>,
    sessions: Arc<SessionRepository>,
    auth: Arc<AuthStateMachine>,
    listener: Option<JoinHandle<()>>,
}

impl AppContext {
    /// Wire the auth stack. Must be called from within a tokio runtime.
    pub fn new(config: &Config, backend: Box<dyn SecretBackend>) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::new(backend));
        let notifier = UnauthorizedNotifier::new();
        let pipeline = Arc::new(
            RequestPipeline::new(config, credentials.clone(), notifier.clone())
                .context("Failed to build HTTP client")?,
        );
        let sessions = Arc::new(SessionRepository::new(pipeline.clone(), credentials.clone()));
        let auth = Arc::new(AuthStateMachine::new(sessions.clone(), credentials.clone()));
        let listener = auth.spawn_unauthorized_listener(notifier.subscribe());

        debug!(base_url = %pipeline.base_url(), "Auth stack wired");
        Ok(Self {
            credentials,
            pipeline,
            sessions,
            auth,
            listener: Some(listener),
        })
    }

    /// Open the secret backend selected in `config`.
    ///
    /// The encrypted file backend needs a passphrase; the keychain does not.
    pub fn open_backend(config: &Config, passphrase: Option<&str>) -> Result<Box<dyn SecretBackend>> {
        match config.credential_backend {
            CredentialBackendKind::Keyring => Ok(Box::new(KeyringBackend::new())),
            CredentialBackendKind::EncryptedFile => {
                let passphrase = passphrase
                    .ok_or_else(|| anyhow!("A vault passphrase is required for encrypted file storage"))?;
                let path = config.cache_dir()?.join(VAULT_FILE);
                Ok(Box::new(EncryptedFileBackend::open(path, passphrase)?))
            }
        }
    }

    /// Resource screens issue requests through this
    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn auth(&self) -> &Arc<AuthStateMachine> {
        &self.auth
    }

    pub fn sessions(&self) -> &Arc<SessionRepository> {
        &self.sessions
    }

    pub fn current_state(&self) -> AuthState {
        self.auth.current_state()
    }

    pub(crate) fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn shutdown(mut self) {
        self.stop_listener();
        info!("Auth stack shut down");
    }

    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.stop_listener();
    }
}
