//! Authenticated session and request coordination for the spendguard API.
//!
//! Keeps one access/refresh token pair per process, refreshes it at most once
//! no matter how many requests notice it expired, retries each failed request
//! once with the new token, and asks the UI to step in when the session cannot
//! be saved.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use spendguard_core::{Config, SessionManager};
//!
//! let config = Config::load()?;
//! let manager = SessionManager::connect(&config)?;
//! manager.notifier().on_session_invalid(|reason| {
//!     eprintln!("Please sign in again: {}", reason);
//! })?;
//! let budgets: serde_json::Value = manager.get_json("/api/v1/budgets").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod logging;
pub mod manager;
pub mod notifier;

#[cfg(test)]
mod test_support;

pub use api::{
    ApiError, ApiRequest, ApiResponse, RefreshCoordinator, RefreshEndpoint, RefreshOutcome,
    RejectReason, ReqwestTransport, RequestPipeline, Transport, TransportError,
};
pub use auth::{Session, SessionPersistence, SessionStore};
pub use config::{Config, StorageKind};
pub use logging::{init_tracing, LogTarget};
pub use manager::{SessionManager, SessionStatus};
pub use notifier::{NotifierError, SessionNotifier, UserChoice};
