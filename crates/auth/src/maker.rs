//! Token issuance and verification.

use std::sync::Arc;

use chrono::Duration;

use snipstash_core::{Clock, SystemClock};

use crate::{CredentialCodec, Payload, TokenError};

/// Issues and verifies tamper-evident, time-bound tokens.
pub trait TokenMaker: Send + Sync {
    /// Issue a token for `subject` valid for `ttl`.
    ///
    /// The payload is returned alongside the text so callers can persist its
    /// id and expiry without decoding again.
    fn create_token(&self, subject: &str, ttl: Duration) -> Result<(String, Payload), TokenError>;

    /// Decode and check expiry. Each call is independent.
    fn verify_token(&self, token: &str) -> Result<Payload, TokenError>;
}

/// [`TokenMaker`] backed by the `v2.local` [`CredentialCodec`].
///
/// Expiry uses zero clock-skew tolerance: a token is rejected as soon as the
/// maker's clock is past `expired_at`.
pub struct PasetoMaker {
    codec: CredentialCodec,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for PasetoMaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PasetoMaker").finish_non_exhaustive()
    }
}

impl PasetoMaker {
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        Self::with_clock(key, Arc::new(SystemClock))
    }

    pub fn with_clock(key: &[u8], clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        Ok(Self {
            codec: CredentialCodec::new(key)?,
            clock,
        })
    }
}

impl TokenMaker for PasetoMaker {
    fn create_token(&self, subject: &str, ttl: Duration) -> Result<(String, Payload), TokenError> {
        let payload = Payload::new(subject, ttl, self.clock.now())?;
        let token = self.codec.encode(&payload)?;
        Ok((token, payload))
    }

    fn verify_token(&self, token: &str) -> Result<Payload, TokenError> {
        let payload = self.codec.decode(token)?;
        payload.validate(self.clock.now())?;
        Ok(payload)
    }
}
