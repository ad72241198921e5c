//! Durable storage for the session record.
//!
//! Each backend holds at most one record. Absence of the record means the
//! user is logged out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

use super::Session;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "spendguard";

/// Keychain account the session record is stored under
const KEYRING_ACCOUNT: &str = "session";

/// Synchronous key-value storage for the single session record.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;

    fn save(&self, session: &Session) -> Result<()>;

    fn remove(&self) -> Result<()>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// JSON file in the cache directory.
pub struct FilePersistence {
    cache_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl SessionPersistence for FilePersistence {
    fn load(&self) -> Result<Option<Session>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let session = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        let contents = serde_json::to_string_pretty(session)?;

        // Write to a temp file then rename so a crash never leaves half a record
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        debug!(path = %path.display(), "Session persisted");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(&path).context("Failed to remove session file")?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// OS keychain entry holding the serialized record.
pub struct KeyringPersistence {
    service: String,
    account: String,
}

impl KeyringPersistence {
    pub fn new() -> Self {
        Self::with_names(SERVICE_NAME, KEYRING_ACCOUNT)
    }

    pub fn with_names(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPersistence for KeyringPersistence {
    fn load(&self) -> Result<Option<Session>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let session =
                    serde_json::from_str(&secret).context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        let secret = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store session in keychain")
    }

    fn remove(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

/// Process-local storage. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    slot: Arc<Mutex<Option<Session>>>,
}

impl MemoryPersistence {
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Copy of the stored record
    pub fn snapshot(&self) -> Option<Session> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.snapshot())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
