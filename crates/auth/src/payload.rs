use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use snipstash_core::TokenId;

use crate::TokenError;

/// Claims embedded in every issued token (transport-agnostic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Unique per issuance. For refresh tokens this is also the session id.
    pub id: TokenId,

    /// Principal name the token was issued to.
    pub subject: String,

    pub issued_at: DateTime<Utc>,

    pub expired_at: DateTime<Utc>,
}

impl Payload {
    /// Build a fresh payload valid for `ttl` from `now`.
    ///
    /// A negative `ttl` is accepted and yields an already-expired payload.
    pub fn new(subject: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Result<Self, TokenError> {
        let expired_at = now
            .checked_add_signed(ttl)
            .ok_or(TokenError::InvalidDuration)?;

        Ok(Self {
            id: TokenId::new(),
            subject: subject.into(),
            issued_at: now,
            expired_at,
        })
    }

    /// Expiry check with zero clock-skew tolerance.
    ///
    /// A token is still valid at exactly `expired_at` and expired one tick later.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if now > self.expired_at {
            return Err(TokenError::ExpiredToken);
        }
        Ok(())
    }
}
