//! Outbound API calls and the session handling wrapped around them.
//!
//! This module provides:
//! - `Transport`: the pluggable HTTP seam, with a reqwest implementation
//! - `RefreshCoordinator`: single-flight access token refresh
//! - `RequestPipeline`: proactive refresh, one retry on 401, escalation
//! - `ApiError`: what callers see when a request fails

pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod transport;

pub use error::ApiError;
pub use pipeline::{RequestPipeline, DEFAULT_EXEMPT_PATHS};
pub use refresh::{RefreshCoordinator, RefreshEndpoint, RefreshOutcome, RejectReason};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, TransportError};
