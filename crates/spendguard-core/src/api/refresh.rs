//! Single-flight access token refresh.
//!
//! Any number of callers may ask for a fresh token at once. The first caller
//! to find the coordinator idle starts a refresh cycle; everyone who arrives
//! while it is in flight is enrolled as a waiter. When the refresh endpoint
//! answers, one `Arc<RefreshOutcome>` is handed to every waiter (the initiator
//! included) and the coordinator goes back to idle.
//!
//! The refresh itself runs on its own task, so a caller that gives up waiting
//! (timeout, dropped future) never cancels the refresh other callers need.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::SessionStore;

/// Why a session cannot be renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The refresh endpoint said the refresh token is expired or invalid
    Refused {
        code: String,
        message: Option<String>,
    },
    /// The session has no refresh token to present
    MissingRefreshToken,
    /// The session was cleared (logout) while the refresh was in flight
    SessionEnded,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Refused { code, message: Some(message) } => write!(f, "{} ({})", message, code),
            RejectReason::Refused { code, message: None } => write!(f, "refresh token refused ({})", code),
            RejectReason::MissingRefreshToken => write!(f, "no refresh token available"),
            RejectReason::SessionEnded => write!(f, "session ended"),
        }
    }
}

/// Result of one refresh cycle, shared by every caller enrolled in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The store now holds these tokens
    Renewed {
        access_token: String,
        refresh_token: Option<String>,
    },
    /// Terminal for the session; it has already been cleared
    Rejected { reason: RejectReason },
    /// Terminal for this attempt only; the session is untouched
    TransportFailure { cause: String },
}

impl RefreshOutcome {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RefreshOutcome::Renewed { .. })
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            RefreshOutcome::Renewed { access_token, .. } => Some(access_token),
            _ => None,
        }
    }
}

/// Where and how to call the refresh endpoint.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub path: String,
    /// Error codes meaning "this refresh token will never work again"
    pub rejection_codes: Vec<String>,
}

impl Default for RefreshEndpoint {
    fn default() -> Self {
        Self {
            path: "/api/v1/users/refresh-token".to_string(),
            rejection_codes: vec![
                "REFRESH_TOKEN_EXPIRED".to_string(),
                "REFRESH_TOKEN_INVALID".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    status: Option<String>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshErrorResponse {
    code: Option<String>,
    message: Option<String>,
}

/// What the refresh endpoint's answer means, before the store is touched.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Renewed {
        access_token: String,
        refresh_token: Option<String>,
    },
    Refused(RejectReason),
    Failed(String),
}

fn interpret(response: &ApiResponse, rejection_codes: &[String]) -> Verdict {
    if response.is_success() {
        return match response.json::<RefreshResponse>() {
            Ok(RefreshResponse {
                status: Some(status),
                access_token: Some(access_token),
                refresh_token,
                ..
            }) if status == "success" && !access_token.is_empty() => Verdict::Renewed {
                access_token,
                refresh_token: refresh_token.filter(|t| !t.is_empty()),
            },
            Ok(body) => Verdict::Failed(
                body.message
                    .unwrap_or_else(|| "Failed to refresh token".to_string()),
            ),
            Err(e) => Verdict::Failed(format!("Unreadable refresh response: {}", e)),
        };
    }

    let body = response.json::<RefreshErrorResponse>().ok();
    let code = body.as_ref().and_then(|b| b.code.clone());
    let message = body.and_then(|b| b.message);
    match code {
        Some(code) if rejection_codes.iter().any(|c| *c == code) => {
            Verdict::Refused(RejectReason::Refused { code, message })
        }
        _ => Verdict::Failed(match message {
            Some(message) => format!("Status {}: {}", response.status, message),
            None => format!("Status {}", response.status),
        }),
    }
}

enum CoordinatorState {
    Idle,
    Refreshing {
        cycle: u64,
        waiters: Vec<oneshot::Sender<Arc<RefreshOutcome>>>,
    },
}

struct Shared {
    state: Mutex<CoordinatorState>,
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    endpoint: RefreshEndpoint,
    cycles: AtomicU64,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the outcome to every enrolled waiter and go back to idle, all
    /// under the state lock so no caller can slip between the two.
    fn broadcast(&self, outcome: Arc<RefreshOutcome>) {
        let mut state = self.lock_state();
        let CoordinatorState::Refreshing { cycle, waiters } =
            std::mem::replace(&mut *state, CoordinatorState::Idle)
        else {
            return;
        };

        let enrolled = waiters.len();
        let delivered = waiters
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .map(|tx| tx.send(Arc::clone(&outcome)))
            .filter(Result::is_ok)
            .count();
        debug!(cycle, enrolled, delivered, "Refresh outcome broadcast");
    }

    async fn refresh(&self) -> RefreshOutcome {
        let Some(session) = self.store.get() else {
            debug!("Session cleared before refresh started");
            return RefreshOutcome::Rejected {
                reason: RejectReason::SessionEnded,
            };
        };
        let Some(refresh_token) = session.refresh_token.clone().filter(|t| !t.is_empty()) else {
            warn!("No refresh token on file, session cannot be renewed");
            self.clear_session();
            return RefreshOutcome::Rejected {
                reason: RejectReason::MissingRefreshToken,
            };
        };

        let request = ApiRequest::post(
            self.endpoint.path.clone(),
            json!({ "refreshToken": refresh_token }),
        )
        .anonymous();

        let response = match self.transport.execute(&request, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Refresh request failed");
                return RefreshOutcome::TransportFailure {
                    cause: e.to_string(),
                };
            }
        };

        match interpret(&response, &self.endpoint.rejection_codes) {
            Verdict::Renewed {
                access_token,
                refresh_token: rotated,
            } => self.apply_renewal(&refresh_token, access_token, rotated),
            Verdict::Refused(reason) => {
                error!(%reason, "Refresh token rejected, clearing session");
                self.clear_session();
                RefreshOutcome::Rejected { reason }
            }
            Verdict::Failed(cause) => {
                warn!(status = response.status.as_u16(), %cause, "Refresh attempt failed");
                RefreshOutcome::TransportFailure { cause }
            }
        }
    }

    fn apply_renewal(
        &self,
        presented: &str,
        access_token: String,
        rotated: Option<String>,
    ) -> RefreshOutcome {
        let rotated_refresh = rotated.is_some();
        match self.store.update_tokens_if(presented, access_token, rotated) {
            Ok(Some(session)) => {
                info!(
                    rotated_refresh,
                    expires_at = ?crate::auth::expiry::expiration(&session.access_token),
                    "Access token refreshed"
                );
                RefreshOutcome::Renewed {
                    access_token: session.access_token.clone(),
                    refresh_token: session.refresh_token.clone(),
                }
            }
            Ok(None) => {
                debug!("Session changed during refresh, discarding renewed tokens");
                RefreshOutcome::Rejected {
                    reason: RejectReason::SessionEnded,
                }
            }
            Err(e) => {
                // The in-memory swap already happened; only the disk copy is behind
                warn!(error = %e, "Failed to persist refreshed session");
                match self.store.get() {
                    Some(session) => RefreshOutcome::Renewed {
                        access_token: session.access_token.clone(),
                        refresh_token: session.refresh_token.clone(),
                    },
                    None => RefreshOutcome::Rejected {
                        reason: RejectReason::SessionEnded,
                    },
                }
            }
        }
    }

    fn clear_session(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }
    }
}

/// Broadcasts on drop, so waiters are released even if the refresh task is
/// cancelled or panics mid-flight.
struct CycleGuard {
    shared: Arc<Shared>,
    outcome: Option<RefreshOutcome>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            warn!("Refresh task ended without an outcome");
            RefreshOutcome::TransportFailure {
                cause: "refresh was interrupted".to_string(),
            }
        });
        self.shared.broadcast(Arc::new(outcome));
    }
}

/// Coordinates access token refreshes for one session store.
/// Clone is cheap and clones share the same in-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        endpoint: RefreshEndpoint,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CoordinatorState::Idle),
                store,
                transport,
                endpoint,
                cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Get a fresh access token, joining the in-flight refresh if there is
    /// one and starting a new one otherwise.
    pub async fn ensure_fresh_token(&self) -> Arc<RefreshOutcome> {
        self.join_cycle(None).await
    }

    /// Like [`ensure_fresh_token`](Self::ensure_fresh_token), for a caller
    /// whose `rejected` token was just refused by the server. If the store
    /// already holds a different token, a refresh finished after that call
    /// went out and its token is reused instead of starting another cycle.
    pub async fn refresh_rejected(&self, rejected: &str) -> Arc<RefreshOutcome> {
        self.join_cycle(Some(rejected)).await
    }

    async fn join_cycle(&self, rejected: Option<&str>) -> Arc<RefreshOutcome> {
        let receiver = {
            let mut state = self.shared.lock_state();
            let (tx, rx) = oneshot::channel();
            match &mut *state {
                CoordinatorState::Refreshing { cycle, waiters } => {
                    waiters.push(tx);
                    debug!(cycle = *cycle, waiters = waiters.len(), "Joined in-flight refresh");
                }
                CoordinatorState::Idle => {
                    if let Some(outcome) = rejected.and_then(|token| self.superseded(token)) {
                        return outcome;
                    }
                    let cycle = self.shared.cycles.fetch_add(1, Ordering::SeqCst) + 1;
                    *state = CoordinatorState::Refreshing {
                        cycle,
                        waiters: vec![tx],
                    };
                    debug!(cycle, "Starting refresh");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let mut guard = CycleGuard {
                            shared: Arc::clone(&shared),
                            outcome: None,
                        };
                        guard.outcome = Some(shared.refresh().await);
                    });
                }
            }
            rx
        };

        receiver.await.unwrap_or_else(|_| {
            Arc::new(RefreshOutcome::TransportFailure {
                cause: "refresh was interrupted".to_string(),
            })
        })
    }

    /// A newer token than the rejected one is already in the store
    fn superseded(&self, rejected: &str) -> Option<Arc<RefreshOutcome>> {
        let session = self.shared.store.get()?;
        if session.access_token == rejected {
            return None;
        }
        debug!("Rejected token already replaced, reusing current token");
        Some(Arc::new(RefreshOutcome::Renewed {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
        }))
    }

    /// Number of callers waiting on the in-flight refresh
    pub fn pending_waiters(&self) -> usize {
        match &*self.shared.lock_state() {
            CoordinatorState::Refreshing { waiters, .. } => waiters.len(),
            CoordinatorState::Idle => 0,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(&*self.shared.lock_state(), CoordinatorState::Refreshing { .. })
    }

    /// Total refresh cycles started since construction
    pub fn cycles_started(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryPersistence, Session};
    use crate::test_support::{FakeTransport, RefreshReply};
    use reqwest::StatusCode;
    use std::time::Duration;

    fn codes() -> Vec<String> {
        RefreshEndpoint::default().rejection_codes
    }

    fn setup(transport: Arc<FakeTransport>) -> (Arc<SessionStore>, RefreshCoordinator) {
        let store = Arc::new(SessionStore::new(Box::new(MemoryPersistence::default())));
        store
            .set(Session::new(transport.valid_token(), Some("r0".into())))
            .unwrap();
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&store), transport, RefreshEndpoint::default());
        (store, coordinator)
    }

    async fn wait_for_waiters(coordinator: &RefreshCoordinator, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.pending_waiters() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("waiters never enrolled");
    }

    #[test]
    fn test_interpret_success_with_and_without_rotation() {
        let ok = ApiResponse::new(
            StatusCode::OK,
            r#"{"status":"success","accessToken":"a2","refreshToken":"r2"}"#,
        );
        assert_eq!(
            interpret(&ok, &codes()),
            Verdict::Renewed {
                access_token: "a2".into(),
                refresh_token: Some("r2".into())
            }
        );

        let no_rotation = ApiResponse::new(StatusCode::OK, r#"{"status":"success","accessToken":"a2"}"#);
        assert_eq!(
            interpret(&no_rotation, &codes()),
            Verdict::Renewed {
                access_token: "a2".into(),
                refresh_token: None
            }
        );
    }

    #[test]
    fn test_interpret_failures() {
        let refused = ApiResponse::new(
            StatusCode::UNAUTHORIZED,
            r#"{"status":"fail","code":"REFRESH_TOKEN_EXPIRED","message":"Refresh token expired"}"#,
        );
        assert!(matches!(
            interpret(&refused, &codes()),
            Verdict::Refused(RejectReason::Refused { ref code, .. }) if code == "REFRESH_TOKEN_EXPIRED"
        ));

        let generic = ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"code":"SOMETHING_ELSE"}"#);
        assert!(matches!(interpret(&generic, &codes()), Verdict::Failed(_)));

        let server = ApiResponse::new(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(interpret(&server, &codes()), Verdict::Failed(ref c) if c.contains("502")));

        let not_success = ApiResponse::new(StatusCode::OK, r#"{"status":"fail","message":"nope"}"#);
        assert_eq!(interpret(&not_success, &codes()), Verdict::Failed("nope".into()));

        let garbage = ApiResponse::new(StatusCode::OK, "not json");
        assert!(matches!(interpret(&garbage, &codes()), Verdict::Failed(_)));
    }

    #[tokio::test]
    async fn test_single_refresh_updates_store() {
        let transport = FakeTransport::new();
        let (store, coordinator) = setup(Arc::clone(&transport));

        let outcome = coordinator.ensure_fresh_token().await;
        assert!(outcome.is_renewed());
        assert_eq!(transport.refresh_calls(), 1);

        let session = store.get().unwrap();
        assert_eq!(Some(session.access_token.as_str()), outcome.access_token());
        assert_eq!(session.access_token, transport.valid_token());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_reuses_refresh_token_when_not_rotated() {
        let transport = FakeTransport::new();
        transport.set_rotation(false);
        let (store, coordinator) = setup(Arc::clone(&transport));

        coordinator.ensure_fresh_token().await;
        assert_eq!(store.refresh_token().as_deref(), Some("r0"));
        assert_eq!(transport.presented_refresh_tokens(), vec!["r0".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_cycle() {
        const CALLERS: usize = 12;
        let transport = FakeTransport::gated();
        let (_store, coordinator) = setup(Arc::clone(&transport));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.ensure_fresh_token().await })
            })
            .collect();

        wait_for_waiters(&coordinator, CALLERS).await;
        assert!(coordinator.is_refreshing());
        transport.release_refresh();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(coordinator.cycles_started(), 1);
        assert!(outcomes.iter().all(|o| Arc::ptr_eq(o, &outcomes[0])));
        assert!(outcomes[0].is_renewed());
        assert_eq!(coordinator.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_store_and_stops_further_refreshes() {
        let transport = FakeTransport::new();
        transport.set_refresh_reply(RefreshReply::Refused("REFRESH_TOKEN_EXPIRED"));
        let (store, coordinator) = setup(Arc::clone(&transport));

        let outcome = coordinator.ensure_fresh_token().await;
        assert!(matches!(
            &*outcome,
            RefreshOutcome::Rejected { reason: RejectReason::Refused { code, .. } } if code == "REFRESH_TOKEN_EXPIRED"
        ));
        assert!(store.get().is_none());

        let again = coordinator.ensure_fresh_token().await;
        assert!(matches!(
            &*again,
            RefreshOutcome::Rejected { reason: RejectReason::SessionEnded }
        ));
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_never_calls_endpoint() {
        let transport = FakeTransport::new();
        let store = Arc::new(SessionStore::new(Box::new(MemoryPersistence::default())));
        store.set(Session::new("a0", None)).unwrap();
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn Transport>,
            RefreshEndpoint::default(),
        );

        let outcome = coordinator.ensure_fresh_token().await;
        assert!(matches!(
            &*outcome,
            RefreshOutcome::Rejected { reason: RejectReason::MissingRefreshToken }
        ));
        assert_eq!(transport.refresh_calls(), 0);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_session_untouched() {
        let transport = FakeTransport::new();
        transport.set_refresh_reply(RefreshReply::Timeout);
        let (store, coordinator) = setup(Arc::clone(&transport));
        let before = store.get().unwrap();

        let outcome = coordinator.ensure_fresh_token().await;
        assert!(matches!(&*outcome, RefreshOutcome::TransportFailure { .. }));
        assert_eq!(*store.get().unwrap(), *before);

        transport.set_refresh_reply(RefreshReply::ServerError);
        let outcome = coordinator.ensure_fresh_token().await;
        assert!(matches!(&*outcome, RefreshOutcome::TransportFailure { .. }));
        assert_eq!(transport.refresh_calls(), 2);
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_refresh() {
        let transport = FakeTransport::gated();
        let (store, coordinator) = setup(Arc::clone(&transport));

        let impatient = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(20), coordinator.ensure_fresh_token()).await
            })
        };
        let patient = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh_token().await })
        };

        wait_for_waiters(&coordinator, 2).await;
        assert!(impatient.await.unwrap().is_err());
        assert!(coordinator.is_refreshing());

        transport.release_refresh();
        assert!(patient.await.unwrap().is_renewed());
        assert_eq!(store.access_token(), Some(transport.valid_token()));
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_superseded_rejection_reuses_current_token() {
        let transport = FakeTransport::new();
        let (store, coordinator) = setup(Arc::clone(&transport));
        let stale = store.access_token().unwrap();

        coordinator.ensure_fresh_token().await;
        let outcome = coordinator.refresh_rejected(&stale).await;
        assert_eq!(outcome.access_token(), store.access_token().as_deref());
        assert_eq!(transport.refresh_calls(), 1);

        // Rejecting the current token does start a new cycle
        let current = store.access_token().unwrap();
        coordinator.refresh_rejected(&current).await;
        assert_eq!(transport.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_tokens() {
        let transport = FakeTransport::gated();
        let (store, coordinator) = setup(Arc::clone(&transport));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh_token().await })
        };
        wait_for_waiters(&coordinator, 1).await;
        store.clear().unwrap();
        transport.release_refresh();

        let outcome = waiter.await.unwrap();
        assert!(matches!(
            &*outcome,
            RefreshOutcome::Rejected { reason: RejectReason::SessionEnded }
        ));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_reject_reason_display() {
        let reason = RejectReason::Refused {
            code: "REFRESH_TOKEN_INVALID".into(),
            message: None,
        };
        assert_eq!(reason.to_string(), "refresh token refused (REFRESH_TOKEN_INVALID)");
        assert_eq!(RejectReason::MissingRefreshToken.to_string(), "no refresh token available");
    }
}
