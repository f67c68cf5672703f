//! Application configuration management.
//!
//! Configuration is stored at `~/.config/crmv3/config.json`. A missing file
//! means defaults. `CRMV3_API_URL` overrides the stored API base URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{CredentialStore, FileCredentialStore, KeyringCredentialStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "crmv3";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_API_URL: &str = "CRMV3_API_URL";
pub const ENV_USERNAME: &str = "CRMV3_USERNAME";
pub const ENV_PASSWORD: &str = "CRMV3_PASSWORD";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on one refresh exchange. Hitting it signs the user out.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

/// Where the credential pair is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    /// Use unverified token claims as the profile when the profile endpoint
    /// is unreachable and nothing is cached.
    pub allow_unverified_profile_fallback: bool,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            credential_backend: CredentialBackend::default(),
            allow_unverified_profile_fallback: false,
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Build the configured credential store.
    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::File => Arc::new(FileCredentialStore::new(self.cache_dir()?)),
            CredentialBackend::Keyring => Arc::new(KeyringCredentialStore::new()),
        })
    }
}
