//! Producer side of the job queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument};

use snipstash_auth::{DispatchError, NotificationDispatcher};

use super::broker::Broker;
use super::tasks::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};
use super::types::{Job, JobId, JobOptions, QUEUE_CRITICAL};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("failed to serialize job payload: {0}")]
    Serialization(String),

    #[error("failed to enqueue job: {0}")]
    EnqueueFailed(String),
}

/// Options used when registration schedules the verification mail.
pub fn verify_email_options() -> JobOptions {
    JobOptions::new()
        .max_retry(10)
        .delay(Duration::from_secs(10))
        .queue(QUEUE_CRITICAL)
}

/// Serializes payloads and hands them to the broker.
#[derive(Clone)]
pub struct TaskDistributor {
    broker: Arc<dyn Broker>,
    enqueue_timeout: Duration,
}

impl TaskDistributor {
    pub fn new(broker: Arc<dyn Broker>, enqueue_timeout: Duration) -> Self {
        Self {
            broker,
            enqueue_timeout,
        }
    }

    /// Enqueue one job. Returns once the broker has durably accepted it.
    #[instrument(skip(self, payload, options), fields(job_type = %job_type, queue = %options.queue))]
    pub async fn enqueue<T>(
        &self,
        job_type: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobId, EnqueueError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| EnqueueError::Serialization(e.to_string()))?;

        let job = Job::new(job_type, bytes, options);
        let max_retry = job.options.max_retry;
        let delay = job.options.delay;

        let id = match tokio::time::timeout(self.enqueue_timeout, self.broker.enqueue(job)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                error!(error = %e, "broker rejected job");
                return Err(EnqueueError::EnqueueFailed(e.to_string()));
            }
            Err(_) => {
                error!(timeout = ?self.enqueue_timeout, "broker did not answer in time");
                return Err(EnqueueError::EnqueueFailed(format!(
                    "broker did not answer within {:?}",
                    self.enqueue_timeout
                )));
            }
        };

        info!(job_id = %id, max_retry, delay = ?delay, "enqueued job");
        Ok(id)
    }

    pub async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        options: JobOptions,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue(TASK_SEND_VERIFY_EMAIL, payload, options).await
    }
}

#[async_trait]
impl NotificationDispatcher for TaskDistributor {
    async fn dispatch_verify_email(&self, name: &str) -> Result<(), DispatchError> {
        let payload = PayloadSendVerifyEmail {
            name: name.to_string(),
        };
        self.distribute_send_verify_email(&payload, verify_email_options())
            .await
            .map(|_| ())
            .map_err(|e| DispatchError(e.to_string()))
    }
}
