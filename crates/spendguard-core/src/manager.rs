//! Process-wide owner of the session machinery.
//!
//! `SessionManager` wires one store, one refresh coordinator, one request
//! pipeline and one notifier together. Create it once at startup and share
//! the `Arc`; every component it hands out talks to the same session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::api::{
    ApiError, ApiRequest, ApiResponse, RefreshCoordinator, RefreshOutcome, RejectReason,
    ReqwestTransport, RequestPipeline, Transport,
};
use crate::auth::{expiry, Session, SessionPersistence, SessionStore};
use crate::config::Config;
use crate::notifier::{SessionNotifier, UserChoice};

/// Snapshot of the session for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct SessionStatus {
    pub authenticated: bool,
    pub display_name: Option<String>,
    pub user_id: Option<String>,
    /// Access token expiry, epoch seconds
    pub expires_at: Option<i64>,
    pub escalated: bool,
    pub refreshing: bool,
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    notifier: Arc<SessionNotifier>,
    pipeline: RequestPipeline,
    closed: AtomicBool,
}

impl SessionManager {
    /// Build the manager over the configured storage backend, restoring any
    /// session saved by a previous run.
    pub fn init(config: &Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        Self::with_persistence(config, config.persistence()?, transport)
    }

    /// Build with a reqwest transport pointed at `config.base_url`
    pub fn connect(config: &Config) -> Result<Arc<Self>> {
        let transport = ReqwestTransport::new(config.base_url.clone(), config.request_timeout())?;
        Self::init(config, Arc::new(transport))
    }

    pub fn with_persistence(
        config: &Config,
        persistence: Box<dyn SessionPersistence>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(SessionStore::load(persistence)?);
        let notifier = Arc::new(SessionNotifier::new());
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            config.refresh_endpoint(),
        );
        let pipeline = RequestPipeline::new(
            Arc::clone(&store),
            coordinator.clone(),
            Arc::clone(&notifier),
            transport,
        )
        .with_skew(config.expiry_skew())
        .with_exempt_paths(config.exempt_paths.clone());

        info!(
            base_url = %config.base_url,
            authenticated = store.is_authenticated(),
            "Session manager ready"
        );
        Ok(Arc::new(Self {
            store,
            coordinator,
            notifier,
            pipeline,
            closed: AtomicBool::new(false),
        }))
    }

    /// Stop accepting requests and drop the UI handlers.
    /// A refresh already in flight still runs to completion.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notifier.unregister_all();
            info!("Session manager shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn notifier(&self) -> &SessionNotifier {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    // ===== Requests =====

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if self.is_shut_down() {
            return Err(ApiError::ShutDown);
        }
        self.pipeline.send(request).await
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(response.json()?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(ApiRequest::post(path, body)).await
    }

    /// Refresh now, joining an in-flight refresh if there is one
    pub async fn ensure_fresh_token(&self) -> Arc<RefreshOutcome> {
        self.coordinator.ensure_fresh_token().await
    }

    // ===== Session lifecycle =====

    /// Install the session returned by a successful login or registration.
    /// Clears any escalation that is showing. If the session cannot be
    /// persisted nothing changes and the prompt stays up.
    pub fn establish(&self, session: Session) -> Result<()> {
        self.store.set(session)?;
        self.notifier.notify_recovered();
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.notifier.dismiss();
        self.store.clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Act on the user's answer to the "session expired" prompt.
    ///
    /// `RetryRefresh` makes one more refresh attempt and reports recovery if
    /// it works. `Reauthenticate` drops the session; the prompt stays up
    /// until [`establish`](Self::establish) is called with a new one.
    pub async fn resolve_escalation(&self, choice: UserChoice) -> Result<(), ApiError> {
        info!(?choice, "Resolving session escalation");
        match choice {
            UserChoice::RetryRefresh => {
                let outcome = self.coordinator.ensure_fresh_token().await;
                match &*outcome {
                    RefreshOutcome::Renewed { .. } => {
                        self.notifier.notify_recovered();
                        Ok(())
                    }
                    RefreshOutcome::Rejected {
                        reason: RejectReason::SessionEnded,
                    } => Err(ApiError::NotAuthenticated),
                    RefreshOutcome::Rejected { reason } => {
                        self.notifier.notify_invalid_session(reason);
                        Err(ApiError::SessionInvalid(reason.clone()))
                    }
                    RefreshOutcome::TransportFailure { cause } => {
                        Err(ApiError::RefreshFailed(cause.clone()))
                    }
                }
            }
            UserChoice::Reauthenticate => {
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear persisted session");
                }
                Ok(())
            }
        }
    }

    // ===== Session readout =====

    pub fn session(&self) -> Option<Arc<Session>> {
        self.store.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn access_token(&self) -> Option<String> {
        self.store.access_token()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.store.refresh_token()
    }

    /// `Authorization` header value for the current access token
    pub fn auth_header(&self) -> Option<String> {
        self.access_token().map(|token| format!("Bearer {}", token))
    }

    pub fn access_token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_token()
            .and_then(|token| expiry::expiration(&token))
    }

    /// Merge profile changes into the stored identity
    pub fn update_identity(&self, updates: Map<String, Value>) -> Result<Option<Arc<Session>>> {
        self.store.update_identity(updates)
    }

    pub fn status(&self) -> SessionStatus {
        let session = self.store.get();
        SessionStatus {
            authenticated: session.is_some(),
            display_name: session
                .as_ref()
                .and_then(|s| s.display_name().map(str::to_string)),
            user_id: session.as_ref().and_then(|s| s.user_id()),
            expires_at: session
                .as_ref()
                .and_then(|s| expiry::expiration(&s.access_token))
                .map(|t| t.timestamp()),
            escalated: self.notifier.is_escalated(),
            refreshing: self.coordinator.is_refreshing(),
        }
    }
}
