//! Wraps every outbound call with session handling.
//!
//! For authenticated requests the pipeline:
//! 1. refreshes ahead of time when the token looks expired (best effort),
//! 2. attaches the current access token and sends,
//! 3. on a 401 from a non-auth endpoint, refreshes once and retries once,
//!    or escalates to the user when the session cannot be renewed.
//!
//! A single request never triggers more than one refresh.

use std::sync::Arc;

use chrono::Duration;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::ApiError;
use super::refresh::{RefreshCoordinator, RefreshOutcome, RejectReason};
use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::{expiry, SessionStore};
use crate::notifier::SessionNotifier;

/// Endpoints that take part in obtaining credentials. A 401 from these is
/// final; refreshing in response would recurse.
pub const DEFAULT_EXEMPT_PATHS: [&str; 4] = ["/refresh-token", "/login", "/register", "/verify-email"];

/// What the pre-send expiry check did for this request
enum Proactive {
    Skipped,
    Renewed,
    Failed(String),
}

pub struct RequestPipeline {
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    notifier: Arc<SessionNotifier>,
    transport: Arc<dyn Transport>,
    skew: Duration,
    exempt_paths: Vec<String>,
}

impl RequestPipeline {
    pub fn new(
        store: Arc<SessionStore>,
        coordinator: RefreshCoordinator,
        notifier: Arc<SessionNotifier>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            coordinator,
            notifier,
            transport,
            skew: Duration::seconds(5),
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_exempt_paths(mut self, paths: Vec<String>) -> Self {
        self.exempt_paths = paths;
        self
    }

    /// Whether a 401 from this path must not trigger a refresh
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path.contains(p.as_str()))
    }

    /// Send a request, returning the response only if it succeeded.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if !request.authenticated {
            let response = self.transport.execute(&request, None).await?;
            return Self::check_response(response);
        }

        let exempt = self.is_exempt(&request.path);
        let (token, proactive) = self.credential_for_send(exempt).await?;

        let response = self.transport.execute(&request, Some(&token)).await?;
        if response.is_success() {
            self.notifier.notify_recovered();
            return Ok(response);
        }
        if response.status != StatusCode::UNAUTHORIZED || exempt {
            return Self::check_response(response);
        }

        debug!(path = %request.path, "Access token rejected by server");
        let outcome = match proactive {
            Proactive::Skipped => self.coordinator.refresh_rejected(&token).await,
            // Already refreshed once for this request
            Proactive::Renewed => {
                return Err(ApiError::RetryExhausted {
                    status: response.status,
                })
            }
            Proactive::Failed(cause) => return Err(ApiError::RefreshFailed(cause)),
        };

        match &*outcome {
            RefreshOutcome::Renewed { access_token, .. } => {
                debug!(path = %request.path, "Retrying once with refreshed token");
                let retry = self.transport.execute(&request, Some(access_token)).await?;
                if retry.is_success() {
                    self.notifier.notify_recovered();
                    Ok(retry)
                } else if retry.status == StatusCode::UNAUTHORIZED {
                    warn!(path = %request.path, "Retry after refresh was still unauthorized");
                    Err(ApiError::RetryExhausted {
                        status: retry.status,
                    })
                } else {
                    Self::check_response(retry)
                }
            }
            RefreshOutcome::Rejected { reason } => Err(self.session_lost(reason)),
            RefreshOutcome::TransportFailure { cause } => Err(ApiError::RefreshFailed(cause.clone())),
        }
    }

    /// Send and decode a JSON body
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

    /// Pick the token to send with, refreshing first if it looks expired.
    async fn credential_for_send(&self, exempt: bool) -> Result<(String, Proactive), ApiError> {
        let session = self.store.get().ok_or(ApiError::NotAuthenticated)?;
        if exempt || !expiry::is_expired_or_expiring(&session.access_token, self.skew) {
            return Ok((session.access_token.clone(), Proactive::Skipped));
        }
        // Nothing to renew with; let the server decide
        if !session.has_refresh_token() {
            debug!("Access token expiring but no refresh token, sending as is");
            return Ok((session.access_token.clone(), Proactive::Skipped));
        }

        debug!("Access token expiring, refreshing before send");
        let outcome = self.coordinator.ensure_fresh_token().await;
        match &*outcome {
            RefreshOutcome::Renewed { access_token, .. } => Ok((access_token.clone(), Proactive::Renewed)),
            RefreshOutcome::TransportFailure { cause } => {
                debug!(%cause, "Proactive refresh failed, sending with current token");
                let token = self
                    .store
                    .access_token()
                    .unwrap_or_else(|| session.access_token.clone());
                Ok((token, Proactive::Failed(cause.clone())))
            }
            RefreshOutcome::Rejected { reason } => Err(self.session_lost(reason)),
        }
    }

    /// The session cannot be renewed. Escalate unless it simply ended.
    fn session_lost(&self, reason: &RejectReason) -> ApiError {
        match reason {
            RejectReason::SessionEnded => ApiError::NotAuthenticated,
            _ => {
                self.notifier.notify_invalid_session(reason);
                ApiError::SessionInvalid(reason.clone())
            }
        }
    }

    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }
}
