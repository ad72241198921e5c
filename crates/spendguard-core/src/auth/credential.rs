//! Offline decoding of bearer credentials.
//!
//! Access tokens are three-segment signed tokens (`header.payload.signature`)
//! whose middle segment is a base64url-encoded JSON object. Only the payload is
//! inspected here; the signature is the server's business.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Number of dot-separated segments in a well-formed credential
const SEGMENT_COUNT: usize = 3;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential is empty")]
    Empty,

    #[error("Expected 3 segments, found {0}")]
    SegmentCount(usize),

    #[error("Payload is not valid base64url: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("Payload is not a JSON object: {0}")]
    Claims(#[from] serde_json::Error),
}

/// The parts of a credential the client cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCredential {
    /// `None` when the payload has no usable `exp` claim.
    pub expires_at: Option<DateTime<Utc>>,
    pub claims: Map<String, Value>,
}

impl DecodedCredential {
    /// Look up a claim by name
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

/// Decode a credential without contacting the server.
///
/// Total over all inputs: anything that is not a three-segment token with a
/// JSON-object payload comes back as an error rather than a panic.
pub fn decode(token: &str) -> Result<DecodedCredential, CredentialError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(CredentialError::Empty);
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != SEGMENT_COUNT {
        return Err(CredentialError::SegmentCount(segments.len()));
    }

    let payload = decode_segment(segments[1])?;
    let claims: Map<String, Value> = serde_json::from_slice(&payload)?;
    let expires_at = claims.get("exp").and_then(expiry_from_claim);

    Ok(DecodedCredential { expires_at, claims })
}

/// Issuers disagree on padding, so accept both forms.
fn decode_segment(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if segment.ends_with('=') {
        URL_SAFE.decode(segment)
    } else {
        URL_SAFE_NO_PAD.decode(segment)
    }
}

/// `exp` is epoch seconds; some issuers emit it as a float.
fn expiry_from_claim(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

// ============================================================================
// Tests
// ============================================================================
