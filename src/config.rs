use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::webdav::WebDavSession;

/// Default service endpoint; overridable per config for self-hosted setups.
pub const DEFAULT_API_BASE: &str = "https://api.refsync.org/v1";

/// Escalating retry delays (seconds) after a library version conflict.
const DEFAULT_CONFLICT_DELAYS: [u64; 4] = [2, 5, 10, 30];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("credentials not found")]
    CredentialsNotFound,
    #[error("keyring error: {0}")]
    Keyring(String),
}

/// Client configuration, loaded from a TOML file and injected explicitly
/// into every component constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub user_id: i64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Data directory; defaults to the platform data dir + "refsync".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_conflict_delays")]
    pub conflict_delays: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav: Option<WebDavConfig>,
}

/// WebDAV section of the config file. The password never lives in the file;
/// it comes from the credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    #[serde(default)]
    pub enabled: bool,
    pub scheme: String,
    pub url: String,
    pub username: String,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_conflict_delays() -> Vec<u64> {
    DEFAULT_CONFLICT_DELAYS.to_vec()
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("refsync")
        })
    }

    /// Assemble the WebDAV session, pulling the password from the credential
    /// store. `None` when the config has no WebDAV section.
    pub fn webdav_session(&self, credentials: &CredentialStore) -> Option<WebDavSession> {
        let webdav = self.webdav.as_ref()?;
        let password = credentials
            .get(&format!("webdav-{}", webdav.username))
            .unwrap_or_default();
        Some(WebDavSession {
            enabled: webdav.enabled,
            scheme: webdav.scheme.clone(),
            url: webdav.url.clone(),
            username: webdav.username.clone(),
            password,
        })
    }

    /// API key for the service, from the credential store.
    pub fn api_key(&self, credentials: &CredentialStore) -> Option<String> {
        credentials.get(&format!("api-key-{}", self.user_id)).ok()
    }
}

const KEYRING_SERVICE: &str = "refsync";

/// Secrets storage: system keyring with a permission-restricted file
/// fallback for setups without a keyring daemon.
pub struct CredentialStore {
    file_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file_dir: data_dir.join(".credentials"),
        }
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.file_dir.join(KEYRING_SERVICE).join(name)
    }

    /// Read a secret: file store first, keyring second.
    pub fn get(&self, name: &str) -> Result<String, ConfigError> {
        if let Ok(value) = std::fs::read_to_string(self.file_path(name)) {
            return Ok(value.trim().to_string());
        }

        let entry = keyring::Entry::new(KEYRING_SERVICE, name)
            .map_err(|error| ConfigError::Keyring(error.to_string()))?;
        entry
            .get_password()
            .map_err(|_| ConfigError::CredentialsNotFound)
    }

    /// Store a secret in the file store (always) and the keyring
    /// (best-effort).
    pub fn set(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, value)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, name) {
            let _ = entry.set_password(value);
        }
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ConfigError> {
        let _ = std::fs::remove_file(self.file_path(name));
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, name) {
            let _ = entry.delete_credential();
        }
        Ok(())
    }
}
