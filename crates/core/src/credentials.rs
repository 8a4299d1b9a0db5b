//! Session credential storage.
//!
//! The credential is populated at login, read on every outgoing request
//! and on push channel open, and cleared on logout or when the push
//! channel reports an authentication failure. Components receive an
//! `Arc<dyn CredentialStore>` instead of reading ambient global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Key under which the file store keeps the session token.
pub const SESSION_TOKEN_KEY: &str = "session_token";

/// Errors from credential storage backends.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Key-value holder of the session credential.
pub trait CredentialStore: Send + Sync {
    /// Current session token, if logged in.
    fn token(&self) -> Option<String>;

    fn set_token(&self, token: String) -> Result<(), CredentialError>;

    /// Forget the session token. Clearing an empty store is not an error.
    fn clear(&self) -> Result<(), CredentialError>;
}

/// Process-local store; the credential dies with the session.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_token(&self, token: String) -> Result<(), CredentialError> {
        match self.token.write() {
            Ok(mut guard) => *guard = Some(token),
            Err(poisoned) => *poisoned.into_inner() = Some(token),
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        Ok(())
    }
}

/// Persistent local storage: a JSON object of string keys on disk.
///
/// Every read goes to disk so that a login or logout performed by
/// another process sharing the file is observed immediately.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, CredentialError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn token(&self) -> Option<String> {
        match self.load() {
            Ok(mut entries) => entries.remove(SESSION_TOKEN_KEY),
            Err(e) => {
                // Unreadable stores behave as logged out.
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Credential store unreadable",
                );
                None
            }
        }
    }

    fn set_token(&self, token: String) -> Result<(), CredentialError> {
        let mut entries = self.load()?;
        entries.insert(SESSION_TOKEN_KEY.to_string(), token);
        self.save(&entries)
    }

    fn clear(&self) -> Result<(), CredentialError> {
        let mut entries = self.load()?;
        if entries.remove(SESSION_TOKEN_KEY).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}
