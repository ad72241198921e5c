//! Advisory expiry checks for access tokens.
//!
//! These checks only decide whether a refresh is worth attempting before a
//! call goes out. The server stays the authority: a token judged valid here
//! can still be rejected, and the request pipeline handles that reactively.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::credential;

/// Returns true if the token is expired, expires within `skew`, has no `exp`
/// claim, or cannot be decoded at all.
pub fn is_expired_or_expiring(token: &str, skew: Duration) -> bool {
    is_expired_or_expiring_at(token, skew, Utc::now())
}

/// Same as [`is_expired_or_expiring`] against an explicit clock reading.
pub fn is_expired_or_expiring_at(token: &str, skew: Duration, now: DateTime<Utc>) -> bool {
    match credential::decode(token) {
        Ok(decoded) => match decoded.expires_at {
            Some(expires_at) => {
                // Out-of-range instants cannot be reasoned about; refresh
                let expiring = expires_at
                    .checked_sub_signed(skew)
                    .map_or(true, |refresh_at| now >= refresh_at);
                if expiring {
                    debug!(%expires_at, skew_secs = skew.num_seconds(), "Access token expired or expiring");
                }
                expiring
            }
            None => {
                debug!("Access token has no exp claim, treating as expired");
                true
            }
        },
        Err(e) => {
            debug!(error = %e, "Access token could not be decoded, treating as expired");
            true
        }
    }
}

/// Expiry instant of a token, if it decodes and carries one
pub fn expiration(token: &str) -> Option<DateTime<Utc>> {
    credential::decode(token).ok().and_then(|d| d.expires_at)
}

/// Time left before the token expires, clamped at zero
pub fn time_until_expiry(token: &str) -> Option<Duration> {
    expiration(token).map(|exp| (exp - Utc::now()).max(Duration::zero()))
}
