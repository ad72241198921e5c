//! UI-facing escalation channel.
//!
//! The core never renders anything itself. When the session becomes unusable
//! it calls the registered "session invalid" handler once; further failures
//! are suppressed until the session recovers or the user signs in again. The
//! UI answers later with a [`UserChoice`] via
//! [`SessionManager::resolve_escalation`](crate::SessionManager::resolve_escalation).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::RejectReason;

/// What the user picked on the "session expired" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum UserChoice {
    RetryRefresh,
    Reauthenticate,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NotifierError {
    #[error("A session-invalid handler is already registered")]
    InvalidHandlerRegistered,

    #[error("A session-recovered handler is already registered")]
    RecoveredHandlerRegistered,
}

type InvalidHandler = Arc<dyn Fn(&RejectReason) + Send + Sync>;
type RecoveredHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct SessionNotifier {
    on_invalid: Mutex<Option<InvalidHandler>>,
    on_recovered: Mutex<Option<RecoveredHandler>>,
    escalated: AtomicBool,
    shown: AtomicU64,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler that shows the "session expired" prompt.
    /// One handler per process; unregister before replacing it.
    pub fn on_session_invalid<F>(&self, handler: F) -> Result<(), NotifierError>
    where
        F: Fn(&RejectReason) + Send + Sync + 'static,
    {
        let mut slot = self.on_invalid.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(NotifierError::InvalidHandlerRegistered);
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    /// Register the handler that hides the prompt once the session works again
    pub fn on_session_recovered<F>(&self, handler: F) -> Result<(), NotifierError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut slot = self.on_recovered.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(NotifierError::RecoveredHandlerRegistered);
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    pub fn unregister_session_invalid(&self) {
        *self.on_invalid.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn unregister_session_recovered(&self) {
        *self.on_recovered.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn unregister_all(&self) {
        self.unregister_session_invalid();
        self.unregister_session_recovered();
    }

    /// Whether the prompt is currently up
    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }

    /// How many times the prompt has been shown
    pub fn escalations_shown(&self) -> u64 {
        self.shown.load(Ordering::SeqCst)
    }

    /// Ask the UI to escalate. Returns false when an escalation is already
    /// showing, in which case nothing is called.
    pub(crate) fn notify_invalid_session(&self, reason: &RejectReason) -> bool {
        if self
            .escalated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%reason, "Escalation already showing, suppressed");
            return false;
        }
        self.shown.fetch_add(1, Ordering::SeqCst);

        // Clone out of the lock so the handler may call back into us
        let handler = self
            .on_invalid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                info!(%reason, "Session invalid, escalating to user");
                handler(reason);
            }
            None => warn!(%reason, "Session invalid but no handler is registered"),
        }
        true
    }

    /// Clear an active escalation and tell the UI. No-op when nothing is showing.
    pub(crate) fn notify_recovered(&self) -> bool {
        if self
            .escalated
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let handler = self
            .on_recovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        info!("Session recovered");
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Drop escalation state without calling anyone (logout)
    pub(crate) fn dismiss(&self) {
        self.escalated.store(false, Ordering::SeqCst);
    }
}
