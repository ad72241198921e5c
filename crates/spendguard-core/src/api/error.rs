use reqwest::StatusCode;
use thiserror::Error;

use super::refresh::RejectReason;
use super::transport::TransportError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// The session is gone for good; the user has been asked to sign in again.
    /// Call sites should not show their own error for this one.
    #[error("Session is no longer valid: {0}")]
    SessionInvalid(RejectReason),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Could not refresh session: {0}")]
    RefreshFailed(String),

    #[error("Request still unauthorized after refreshing the session (status {status})")]
    RetryExhausted { status: StatusCode },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Session manager has been shut down")]
    ShutDown,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Worth trying the same call again later without user involvement
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RefreshFailed(_)
                | ApiError::Transport(_)
                | ApiError::RateLimited
                | ApiError::ServerError(_)
        )
    }

    /// The session was escalated to the user; callers should stay quiet
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ApiError::SessionInvalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(ApiError::from_status(StatusCode::UNAUTHORIZED, ""), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(StatusCode::FORBIDDEN, "no"), ApiError::AccessDenied(b) if b == "no"));
        assert!(matches!(ApiError::from_status(StatusCode::NOT_FOUND, ""), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_GATEWAY, ""), ApiError::ServerError(_)));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_REQUEST, ""), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        match ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            ApiError::ServerError(msg) => {
                assert!(msg.contains("truncated, 800 total bytes"));
                assert!(msg.len() < body.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(ApiError::RefreshFailed("timeout".into()).is_retryable());
        assert!(ApiError::Transport(TransportError::Timeout).is_retryable());
        assert!(!ApiError::SessionInvalid(RejectReason::MissingRefreshToken).is_retryable());
        assert!(ApiError::SessionInvalid(RejectReason::MissingRefreshToken).is_session_invalid());
        assert!(!ApiError::RetryExhausted { status: StatusCode::UNAUTHORIZED }.is_retryable());
        assert!(!ApiError::Unauthorized.is_session_invalid());
    }
}
