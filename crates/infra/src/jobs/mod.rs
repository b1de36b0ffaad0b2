//! Background job queue with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `Job`: payload bytes plus delivery options and status
//! - `Broker`: shared persistence for queued jobs (in-memory, or Redis with the `redis` feature)
//! - `TaskDistributor`: producer that serializes payloads and enqueues them
//! - `TaskProcessor`: consumer that routes claimed jobs to handlers and applies
//!   the retry / dead-letter / skip-retry rules
//!
//! Delivery is at-least-once, so handlers must be idempotent.

pub mod broker;
pub mod distributor;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod tasks;
pub mod types;

pub use broker::{Broker, BrokerError, InMemoryBroker, JobStats};
pub use distributor::{EnqueueError, TaskDistributor, verify_email_options};
pub use processor::{
    HandlerError, JobHandler, ProcessorConfig, ProcessorHandle, ProcessorStats, TaskProcessor,
};
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use tasks::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, register_send_verify_email};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobId, JobOptions, JobStatus, QUEUE_CRITICAL,
    QUEUE_DEFAULT, RetryPolicy,
};
