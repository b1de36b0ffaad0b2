//! Error taxonomy for token handling and the auth service.

use thiserror::Error;

use snipstash_core::FieldViolation;

/// Failures of the credential codec and token maker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Unparseable text, failed authentication tag, or unknown version header.
    #[error("token is invalid")]
    InvalidToken,

    /// Well-formed and authentic, but past its expiry.
    #[error("token has expired")]
    ExpiredToken,

    #[error("invalid key size: must be exactly {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("token duration out of range")]
    InvalidDuration,

    #[error("failed to encode token: {0}")]
    Encoding(String),
}

/// Error kinds surfaced by [`crate::AuthService`].
///
/// Lower-level kinds the caller can act on are passed through unchanged;
/// anything else collapses into `Internal` after being logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token has expired")]
    ExpiredToken,

    #[error("not found")]
    NotFound,

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied")]
    PermissionDenied,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid argument")]
    InvalidArgument(Vec<FieldViolation>),

    /// The caller's deadline passed before a storage call completed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error")]
    Internal(String),
}

impl AuthError {
    /// Whether the caller should obtain fresh credentials (log in again).
    pub fn is_reauthenticate(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidToken
                | AuthError::ExpiredToken
                | AuthError::Unauthenticated
                | AuthError::PermissionDenied
                | AuthError::NotFound
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidToken => "invalid_token",
            AuthError::ExpiredToken => "expired_token",
            AuthError::NotFound => "not_found",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::PermissionDenied => "permission_denied",
            AuthError::AlreadyExists => "already_exists",
            AuthError::InvalidArgument(_) => "invalid_argument",
            AuthError::Cancelled => "cancelled",
            AuthError::Internal(_) => "internal",
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::InvalidToken => AuthError::InvalidToken,
            TokenError::ExpiredToken => AuthError::ExpiredToken,
            other => AuthError::Internal(other.to_string()),
        }
    }
}

impl From<Vec<FieldViolation>> for AuthError {
    fn from(value: Vec<FieldViolation>) -> Self {
        AuthError::InvalidArgument(value)
    }
}
