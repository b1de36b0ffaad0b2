//! Concrete task types and their handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use snipstash_auth::{PrincipalStore, RequestContext, StoreError};

use super::processor::{HandlerError, TaskProcessor};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub name: String,
}

/// Register the verification-mail handler.
///
/// The handler only reads the principal, so running it twice is harmless.
/// An unknown principal is retried: the row may not be visible to this
/// reader yet.
pub fn register_send_verify_email(
    processor: &mut TaskProcessor,
    principals: Arc<dyn PrincipalStore>,
    store_timeout: Duration,
) {
    processor.register_typed(TASK_SEND_VERIFY_EMAIL, move |payload: PayloadSendVerifyEmail| {
        let principals = principals.clone();
        async move {
            let principal = RequestContext::new()
                .run(store_timeout, principals.get_principal_by_name(&payload.name))
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => {
                        HandlerError::retryable(format!("user {} not found", payload.name))
                    }
                    other => HandlerError::retryable(format!("failed to load user: {other}")),
                })?;

            info!(name = %principal.name, email = %principal.email, "sending verification email");
            Ok(())
        }
    });
}
