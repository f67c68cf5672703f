//! Durable persistence of the credential pair and cached profile.
//!
//! Pure storage: no expiry policy, no network. Every write replaces the whole
//! record so readers never see half of an update.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::StorageError;
use super::token::BearerToken;
use crate::models::UserProfile;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Keyring service name
const SERVICE_NAME: &str = "crmv3";

/// Keyring account holding the serialized session
const KEYRING_ACCOUNT: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: BearerToken,
    pub refresh_token: BearerToken,
    pub issued_at: DateTime<Utc>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: BearerToken::new(access_token),
            refresh_token: BearerToken::new(refresh_token),
            issued_at: Utc::now(),
        }
    }

    /// The part of the pair that is handed to request code.
    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.access_token.clone(),
            issued_at: self.issued_at,
        }
    }
}

/// An access credential ready to be attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: BearerToken,
    pub issued_at: DateTime<Utc>,
}

/// Everything persisted for one signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub credentials: CredentialPair,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

impl StoredSession {
    pub fn new(credentials: CredentialPair) -> Self {
        Self {
            credentials,
            profile: None,
        }
    }
}

/// Storage abstraction for the persisted session.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredSession>, StorageError>;
    fn save(&self, session: &StoredSession) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// JSON file in the cache directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    cache_dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Write `contents` to a fresh file readable by the owner only.
///
/// The mode is set when the file is created, so the secrets are never on
/// disk with wider permissions.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<StoredSession>, StorageError> {
        let path = self.session_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let session: StoredSession = serde_json::from_str(&contents)?;
        Ok(Some(session))
    }

    fn save(&self, session: &StoredSession) -> Result<(), StorageError> {
        let path = self.session_path();
        Self::ensure_parent(&path)?;
        let contents = serde_json::to_string_pretty(session)?;

        // Write beside the target, then rename over it.
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, contents.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(self.session_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// OS keychain entry holding the serialized session as a single secret.
pub struct KeyringCredentialStore {
    account: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            account: KEYRING_ACCOUNT.to_string(),
        }
    }

    /// Separate keychain slot, e.g. per API host.
    pub fn with_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StorageError> {
        Ok(Entry::new(SERVICE_NAME, &self.account)?)
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self) -> Result<Option<StoredSession>, StorageError> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, session: &StoredSession) -> Result<(), StorageError> {
        let secret = serde_json::to_string(session)?;
        self.entry()?.set_password(&secret)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-local store with no durability.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: Mutex<Option<StoredSession>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: StoredSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<StoredSession>>, StorageError> {
        self.session
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".to_string()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<StoredSession>, StorageError> {
        Ok(self.slot()?.clone())
    }

    fn save(&self, session: &StoredSession) -> Result<(), StorageError> {
        *self.slot()? = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.slot()? = None;
        Ok(())
    }
}
