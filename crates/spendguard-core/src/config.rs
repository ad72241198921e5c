//! Application configuration management.
//!
//! Holds the API location, the refresh endpoint details and where the session
//! is stored. Stored at `~/.config/spendguard/config.json`; a few fields can
//! be overridden from the environment (or a `.env` file).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{RefreshEndpoint, DEFAULT_EXEMPT_PATHS};
use crate::auth::{FilePersistence, KeyringPersistence, MemoryPersistence, SessionPersistence};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "spendguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_BASE_URL: &str = "SPENDGUARD_BASE_URL";
const ENV_EXPIRY_SKEW: &str = "SPENDGUARD_EXPIRY_SKEW_SECS";
const ENV_STORAGE: &str = "SPENDGUARD_STORAGE";

/// Where the session record lives between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => anyhow::bail!("Unknown storage kind: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub refresh_path: String,
    /// A 401 from a path containing one of these never triggers a refresh
    pub exempt_paths: Vec<String>,
    /// Refresh endpoint codes that end the session
    pub rejection_codes: Vec<String>,
    /// Treat tokens this close to expiry as already expired
    pub expiry_skew_secs: u64,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
}

impl Default for Config {
    fn default() -> Self {
        let endpoint = RefreshEndpoint::default();
        Self {
            base_url: "http://localhost:8080".to_string(),
            refresh_path: endpoint.path,
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
            rejection_codes: endpoint.rejection_codes,
            expiry_skew_secs: 5,
            request_timeout_secs: 30,
            storage: StorageKind::default(),
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply env overrides
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env");
        }

        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply environment overrides. Unparseable values are ignored with a warning.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(ENV_BASE_URL).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(raw) = var(ENV_EXPIRY_SKEW) {
            match raw.trim().parse() {
                Ok(secs) => self.expiry_skew_secs = secs,
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", ENV_EXPIRY_SKEW),
            }
        }
        if let Some(raw) = var(ENV_STORAGE) {
            match raw.parse() {
                Ok(kind) => self.storage = kind,
                Err(e) => warn!(error = %e, "Ignoring invalid {}", ENV_STORAGE),
            }
        }
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn refresh_endpoint(&self) -> RefreshEndpoint {
        RefreshEndpoint {
            path: self.refresh_path.clone(),
            rejection_codes: self.rejection_codes.clone(),
        }
    }

    /// Expiry lead time. Values beyond what chrono can represent saturate.
    pub fn expiry_skew(&self) -> chrono::Duration {
        i64::try_from(self.expiry_skew_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the configured session storage backend
    pub fn persistence(&self) -> Result<Box<dyn SessionPersistence>> {
        Ok(match self.storage {
            StorageKind::File => Box::new(FilePersistence::new(self.cache_dir()?)),
            StorageKind::Keyring => Box::new(KeyringPersistence::new()),
            StorageKind::Memory => Box::new(MemoryPersistence::default()),
        })
    }
}
