use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::persistence::SessionPersistence;

/// The durable authentication state.
///
/// Serialized as the single record the app persists: the two tokens plus
/// whatever identity fields the login response carried (name, `_id`, email...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(flatten)]
    pub identity: Map<String, Value>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            identity: Map::new(),
        }
    }

    pub fn with_identity(mut self, identity: Map<String, Value>) -> Self {
        self.identity = identity;
        self
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Name to show in the UI, if the identity carries one
    pub fn display_name(&self) -> Option<&str> {
        ["name", "username", "email"]
            .iter()
            .find_map(|key| self.identity.get(*key).and_then(Value::as_str))
    }

    /// User id from the identity record (`_id` or `id`)
    pub fn user_id(&self) -> Option<String> {
        ["_id", "id"].iter().find_map(|key| match self.identity.get(*key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Owns the current session and keeps the persisted copy in step with it.
///
/// Readers get an `Arc<Session>` snapshot; writers swap the whole snapshot, so
/// a reader never sees a new access token paired with an old refresh token.
pub struct SessionStore {
    current: RwLock<Option<Arc<Session>>>,
    persistence: Box<dyn SessionPersistence>,
}

impl SessionStore {
    pub fn new(persistence: Box<dyn SessionPersistence>) -> Self {
        Self {
            current: RwLock::new(None),
            persistence,
        }
    }

    /// Create a store primed from the persistence backend.
    /// A missing record means logged out; so does an unreadable one, which is
    /// removed. Storage failures other than a corrupt record are returned.
    pub fn load(persistence: Box<dyn SessionPersistence>) -> Result<Self> {
        let loaded = match persistence.load() {
            Ok(loaded) => loaded,
            Err(e) if e.chain().any(|cause| cause.is::<serde_json::Error>()) => {
                warn!(error = %e, backend = persistence.name(), "Discarding corrupt session record");
                if let Err(e) = persistence.remove() {
                    warn!(error = %e, "Failed to remove corrupt session record");
                }
                None
            }
            Err(e) => return Err(e),
        };
        debug!(has_session = loaded.is_some(), backend = persistence.name(), "Session loaded");
        Ok(Self {
            current: RwLock::new(loaded.map(Arc::new)),
            persistence,
        })
    }

    pub fn get(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.get().is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get().and_then(|s| s.refresh_token.clone())
    }

    /// Replace the session (login or registration). Nothing changes unless
    /// the new record is persisted.
    pub fn set(&self, session: Session) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        self.persistence.save(&session)?;
        *current = Some(Arc::new(session));
        info!("Session established");
        Ok(())
    }

    /// Drop the session and its persisted record
    pub fn clear(&self) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let had_session = current.take().is_some();
        self.persistence.remove()?;
        if had_session {
            info!("Session cleared");
        }
        Ok(())
    }

    /// Swap in new tokens, keeping the identity. A `None` refresh token keeps
    /// the existing one. Returns the new snapshot, or `None` when there is no
    /// session to update (it was cleared in the meantime).
    ///
    /// The in-memory swap happens before persisting, so if the write fails the
    /// new tokens are still in use and the error is returned for logging.
    pub fn update_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Option<Arc<Session>>> {
        self.swap_tokens(None, access_token, refresh_token)
    }

    /// Like [`update_tokens`](Self::update_tokens), but only if the session
    /// still holds `presented` as its refresh token. Tokens minted for a
    /// session that was replaced or logged out are dropped.
    pub fn update_tokens_if(
        &self,
        presented: &str,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Option<Arc<Session>>> {
        self.swap_tokens(Some(presented), access_token, refresh_token)
    }

    fn swap_tokens(
        &self,
        expected_refresh: Option<&str>,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Option<Arc<Session>>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let Some(existing) = current.as_ref() else {
            debug!("Token update skipped, no session");
            return Ok(None);
        };
        if let Some(expected) = expected_refresh {
            if existing.refresh_token.as_deref() != Some(expected) {
                debug!("Token update skipped, session was replaced");
                return Ok(None);
            }
        }

        let updated = Arc::new(Session {
            access_token,
            refresh_token: refresh_token.or_else(|| existing.refresh_token.clone()),
            identity: existing.identity.clone(),
        });
        *current = Some(Arc::clone(&updated));
        self.persistence.save(&updated)?;
        Ok(Some(updated))
    }

    /// Merge identity fields (e.g. after a profile edit) without touching tokens
    pub fn update_identity(&self, updates: Map<String, Value>) -> Result<Option<Arc<Session>>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let Some(existing) = current.as_ref() else {
            return Ok(None);
        };

        let mut identity = existing.identity.clone();
        identity.extend(updates);
        let updated = Arc::new(Session {
            access_token: existing.access_token.clone(),
            refresh_token: existing.refresh_token.clone(),
            identity,
        });
        *current = Some(Arc::clone(&updated));
        self.persistence.save(&updated)?;
        Ok(Some(updated))
    }
}
