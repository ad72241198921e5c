//! Scripted transport and token helpers shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::transport::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::api::RefreshEndpoint;
use crate::auth::{MemoryPersistence, Session, SessionPersistence};

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Build an unsigned three-segment token. Every call yields a distinct token.
pub fn make_token(exp: Option<DateTime<Utc>>) -> String {
    let mut claims = json!({ "id": "64f0c2", "nonce": NONCE.fetch_add(1, Ordering::SeqCst) });
    if let Some(exp) = exp {
        claims["exp"] = json!(exp.timestamp());
    }
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

pub fn fresh_token() -> String {
    make_token(Some(Utc::now() + Duration::minutes(15)))
}

pub fn expired_token() -> String {
    make_token(Some(Utc::now() - Duration::seconds(60)))
}

#[derive(Debug, Clone, Copy)]
pub enum RefreshReply {
    Success,
    Refused(&'static str),
    Timeout,
    ServerError,
}

struct Script {
    valid_token: String,
    refresh_reply: RefreshReply,
    rotate: bool,
    overrides: HashMap<String, (StatusCode, String)>,
    presented_refresh_tokens: Vec<String>,
    bearers: Vec<(String, Option<String>)>,
}

/// In-memory stand-in for the API server.
///
/// Authenticated calls succeed only with the current valid token. The refresh
/// endpoint mints a new valid token, optionally held back behind a gate so
/// tests can pile up waiters first.
pub struct FakeTransport {
    script: Mutex<Script>,
    gate: Semaphore,
    refresh_calls: AtomicUsize,
    refresh_path: String,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS)
    }

    /// Refresh responses wait for [`release_refresh`](Self::release_refresh)
    pub fn gated() -> Arc<Self> {
        Self::build(0)
    }

    fn build(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                valid_token: fresh_token(),
                refresh_reply: RefreshReply::Success,
                rotate: true,
                overrides: HashMap::new(),
                presented_refresh_tokens: Vec::new(),
                bearers: Vec::new(),
            }),
            gate: Semaphore::new(permits),
            refresh_calls: AtomicUsize::new(0),
            refresh_path: RefreshEndpoint::default().path,
        })
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn release_refresh(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn valid_token(&self) -> String {
        self.script().valid_token.clone()
    }

    /// Server-side expiry: the token the client holds stops working
    pub fn revoke_access(&self) {
        self.script().valid_token = fresh_token();
    }

    pub fn set_refresh_reply(&self, reply: RefreshReply) {
        self.script().refresh_reply = reply;
    }

    pub fn set_rotation(&self, rotate: bool) {
        self.script().rotate = rotate;
    }

    /// Always answer `path` with this status and body
    pub fn override_path(&self, path: &str, status: StatusCode, body: Value) {
        self.script()
            .overrides
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn presented_refresh_tokens(&self) -> Vec<String> {
        self.script().presented_refresh_tokens.clone()
    }

    /// Bearer tokens seen on calls to `path`, in order
    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.script()
            .bearers
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, b)| b.clone())
            .collect()
    }

    async fn refresh(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }

        let mut script = self.script();
        let presented = request
            .body
            .as_ref()
            .and_then(|b| b["refreshToken"].as_str())
            .unwrap_or_default()
            .to_string();
        script.presented_refresh_tokens.push(presented);

        match script.refresh_reply {
            RefreshReply::Success => {
                script.valid_token = fresh_token();
                let n = script.presented_refresh_tokens.len();
                let body = if script.rotate {
                    json!({ "status": "success", "accessToken": script.valid_token, "refreshToken": format!("r{}", n) })
                } else {
                    json!({ "status": "success", "accessToken": script.valid_token })
                };
                Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
            }
            RefreshReply::Refused(code) => Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                json!({ "status": "fail", "code": code, "message": "Refresh token expired" }).to_string(),
            )),
            RefreshReply::Timeout => Err(TransportError::Timeout),
            RefreshReply::ServerError => Ok(ApiResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"message":"boom"}"#,
            )),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.script()
            .bearers
            .push((request.path.clone(), bearer.map(str::to_string)));

        if request.path == self.refresh_path {
            return self.refresh(request).await;
        }

        let script = self.script();
        if let Some((status, body)) = script.overrides.get(&request.path) {
            return Ok(ApiResponse::new(*status, body.clone()));
        }
        if !request.authenticated || bearer == Some(script.valid_token.as_str()) {
            Ok(ApiResponse::new(
                StatusCode::OK,
                json!({ "status": "success", "path": request.path }).to_string(),
            ))
        } else {
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                json!({ "status": "fail", "code": "TOKEN_EXPIRED", "expired": true }).to_string(),
            ))
        }
    }
}

/// Memory-backed storage that can be told to start failing.
#[derive(Clone, Default)]
pub struct FlakyPersistence {
    inner: MemoryPersistence,
    failing: Arc<AtomicBool>,
}

impl FlakyPersistence {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.inner.snapshot()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("storage unavailable");
        }
        Ok(())
    }
}

impl SessionPersistence for FlakyPersistence {
    fn load(&self) -> anyhow::Result<Option<Session>> {
        self.check()?;
        self.inner.load()
    }

    fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.check()?;
        self.inner.save(session)
    }

    fn remove(&self) -> anyhow::Result<()> {
        self.check()?;
        self.inner.remove()
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
