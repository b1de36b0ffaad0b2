use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Hands slow side effects to the background job queue.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Schedule the verification mail for a freshly registered principal.
    async fn dispatch_verify_email(&self, name: &str) -> Result<(), DispatchError>;
}
