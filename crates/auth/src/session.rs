//! Server-side session bound to a refresh token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snipstash_core::SessionId;

/// Advisory client details recorded with a session (not security-enforced).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub user_agent: String,
    pub client_ip: String,
}

/// A persisted session.
///
/// # Invariants
/// - `id` equals the id of the refresh-token payload that created it.
/// - `refresh_token` is the exact token text issued at login.
/// - `expires_at` equals the refresh payload's `expired_at`.
/// - Only `is_blocked` ever changes after creation, and only from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub subject: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub client_ip: String,
    pub is_blocked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Same zero-tolerance rule as token expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Parameters for creating a session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: SessionId,
    pub subject: String,
    pub refresh_token: String,
    pub metadata: ClientMetadata,
    pub expires_at: DateTime<Utc>,
}
