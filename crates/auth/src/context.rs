//! Per-request context: caller deadline and client metadata.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{ClientMetadata, StoreError};

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    metadata: ClientMetadata,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, metadata: ClientMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &ClientMetadata {
        &self.metadata
    }

    /// Run a storage call bounded by the earlier of the caller deadline and `limit`.
    ///
    /// On expiry the call is dropped and [`StoreError::Cancelled`] returned.
    pub async fn run<T, F>(&self, limit: Duration, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let own = Instant::now() + limit;
        let deadline = match self.deadline {
            Some(d) if d < own => d,
            _ => own,
        };

        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| StoreError::Cancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_cancels_slow_call() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        };

        assert_eq!(ctx.run(Duration::from_secs(5), slow).await, Err(StoreError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn own_limit_applies_without_caller_deadline() {
        let ctx = RequestContext::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        };

        assert_eq!(ctx.run(Duration::from_secs(1), slow).await, Err(StoreError::Cancelled));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(1));
        let value = ctx.run(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(value, Ok(7));
    }
}
