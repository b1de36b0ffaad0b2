//! Consumer side of the job queue: handler registry and worker pool.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerError};
use super::types::{Job, JobStatus, QUEUE_CRITICAL, QUEUE_DEFAULT};

/// Outcome of a failed handler invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient; the job is retried until its `max_retry` budget is spent.
    #[error("handler failed: {0}")]
    Retryable(String),

    /// Permanent; the job is discarded without further invocations.
    #[error("handler failed permanently: {0}")]
    SkipRetry(String),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn skip_retry(reason: impl Into<String>) -> Self {
        Self::SkipRetry(reason.into())
    }
}

/// Executes one job type. Must tolerate running more than once per job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapts a typed async closure into a [`JobHandler`].
///
/// A payload that does not deserialize into `T` fails with `SkipRetry` and
/// the closure is never called.
struct TypedHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> JobHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: T = serde_json::from_slice(&job.payload).map_err(|e| {
            HandlerError::SkipRetry(format!("malformed {} payload: {e}", job.job_type))
        })?;
        (self.handler)(payload).await
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Queues in strict priority order
    pub queues: Vec<String>,
    /// Longest a single invocation may run before it counts as a retryable failure
    pub handler_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            concurrency: 4,
            queues: vec![QUEUE_CRITICAL.to_string(), QUEUE_DEFAULT.to_string()],
            handler_timeout: Duration::from_secs(30),
            name: "task-processor".to_string(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed invocations that were scheduled for another attempt
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_discarded: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
    started: Instant,
}

impl ProcessorHandle {
    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<ProcessorStats>) -> std::sync::MutexGuard<'_, ProcessorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes claimed jobs to registered handlers and reports outcomes to the broker.
pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    handler_timeout: Option<Duration>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            handlers: HashMap::new(),
            handler_timeout: None,
        }
    }

    /// Register a handler for a job type.
    ///
    /// A pattern ending in `*` matches every job type with that prefix;
    /// exact names win over patterns.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    /// Register an async closure taking the deserialized payload.
    pub fn register_typed<T, F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            job_type,
            TypedHandler {
                handler,
                _payload: PhantomData,
            },
        );
    }

    fn handler_for(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        // Longest matching prefix pattern, so `task:*` beats `*`.
        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                job_type.starts_with(prefix).then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler)
    }

    /// Run one claimed job and record the outcome with the broker.
    ///
    /// Returns the job's resulting status.
    pub async fn process_one(&self, mut job: Job) -> Result<JobStatus, BrokerError> {
        let started = Utc::now();

        let outcome = match self.handler_for(&job.job_type) {
            Some(handler) => self.invoke(handler.as_ref(), &job).await,
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered for job type");
                Err(HandlerError::Retryable(format!(
                    "no handler for job type {}",
                    job.job_type
                )))
            }
        };

        match outcome {
            Ok(()) => {
                job.mark_completed(started);
                self.broker.complete(&job).await?;
                debug!(job_id = %job.id, attempt = job.attempt, "job completed");
            }
            Err(HandlerError::SkipRetry(reason)) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %reason, "job discarded without retry");
                job.mark_discarded(reason.clone(), started);
                self.broker.discard(job.clone(), reason).await?;
            }
            Err(HandlerError::Retryable(reason)) => {
                job.mark_failed(reason.clone(), started);
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(job_id = %job.id, attempts = job.attempt, error = %reason, "job dead-lettered");
                    self.broker.dead_letter(job.clone(), reason).await?;
                } else {
                    let at = job.ready_at();
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        max_retry = job.options.max_retry,
                        retry_at = %at,
                        error = %reason,
                        "job failed; retry scheduled"
                    );
                    self.broker.retry(&job, at).await?;
                }
            }
        }

        Ok(job.status)
    }

    async fn invoke(&self, handler: &dyn JobHandler, job: &Job) -> Result<(), HandlerError> {
        match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(job))
                .await
                .unwrap_or_else(|_| {
                    Err(HandlerError::Retryable(format!(
                        "handler timed out after {limit:?}"
                    )))
                }),
            None => handler.handle(job).await,
        }
    }

    /// Start `config.concurrency` workers polling `config.queues`.
    pub fn spawn(mut self, config: ProcessorConfig) -> ProcessorHandle {
        self.handler_timeout = Some(config.handler_timeout);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let processor = Arc::new(self);

        let workers = (0..config.concurrency.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    processor.clone(),
                    config.clone(),
                    worker,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        ProcessorHandle {
            shutdown: shutdown_tx,
            workers,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(
    processor: Arc<TaskProcessor>,
    config: ProcessorConfig,
    worker: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ProcessorStats>>,
) {
    info!(processor = %config.name, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match processor.broker.claim_next(&config.queues).await {
            Ok(Some(job)) => {
                debug!(processor = %config.name, worker, job_id = %job.id, job_type = %job.job_type, "claimed job");
                lock(&stats).current_running += 1;

                let job_id = job.id;
                let result = processor.process_one(job).await;

                let mut s = lock(&stats);
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match result {
                    Ok(JobStatus::Completed) => s.jobs_succeeded += 1,
                    Ok(JobStatus::DeadLettered { .. }) => s.jobs_dead_lettered += 1,
                    Ok(JobStatus::Discarded { .. }) => s.jobs_discarded += 1,
                    Ok(_) => s.jobs_retried += 1,
                    Err(e) => {
                        drop(s);
                        error!(processor = %config.name, job_id = %job_id, error = %e, "failed to record job outcome");
                    }
                }
            }
            Ok(None) => idle(&mut shutdown, config.poll_interval).await,
            Err(e) => {
                error!(processor = %config.name, worker, error = %e, "failed to claim job");
                idle(&mut shutdown, config.poll_interval).await;
            }
        }
    }

    info!(processor = %config.name, worker, "worker stopped");
}

async fn idle(shutdown: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(poll_interval) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::jobs::broker::InMemoryBroker;
    use crate::jobs::types::{JobOptions, RetryPolicy};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    fn queues() -> Vec<String> {
        ProcessorConfig::default().queues
    }

    async fn enqueue(broker: &InMemoryBroker, job_type: &str, payload: &[u8], options: JobOptions) {
        broker
            .enqueue(Job::new(job_type, payload.to_vec(), options))
            .await
            .unwrap();
    }

    /// Claim and process until the queue is empty; returns the last status.
    async fn drain(processor: &TaskProcessor, broker: &InMemoryBroker) -> Option<JobStatus> {
        let mut last = None;
        while let Some(job) = broker.claim_next(&queues()).await.unwrap() {
            last = Some(processor.process_one(job).await.unwrap());
        }
        last
    }

    #[tokio::test]
    async fn typed_handler_receives_payload() {
        let broker = InMemoryBroker::arc();
        let seen = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(broker.clone());
        let sink = seen.clone();
        processor.register_typed("task:ping", move |ping: Ping| {
            let sink = sink.clone();
            async move {
                sink.store(ping.n, Ordering::SeqCst);
                Ok(())
            }
        });

        enqueue(&broker, "task:ping", br#"{"n":7}"#, JobOptions::new()).await;

        assert_eq!(drain(&processor, &broker).await, Some(JobStatus::Completed));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded_without_invoking_handler() {
        let broker = InMemoryBroker::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(broker.clone());
        let counter = calls.clone();
        processor.register_typed("task:ping", move |_: Ping| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        enqueue(&broker, "task:ping", b"not json", JobOptions::new().max_retry(5)).await;

        let status = drain(&processor, &broker).await.unwrap();
        assert!(matches!(status, JobStatus::Discarded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broker.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_use_the_whole_budget_then_dead_letter() {
        let broker = InMemoryBroker::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(broker.clone());
        let counter = calls.clone();
        processor.register_typed("task:ping", move |_: Ping| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::retryable("smtp down"))
            }
        });

        let options = JobOptions::new()
            .max_retry(3)
            .backoff(RetryPolicy::immediate());
        enqueue(&broker, "task:ping", br#"{"n":1}"#, options).await;

        let status = drain(&processor, &broker).await.unwrap();
        assert!(matches!(status, JobStatus::DeadLettered { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let dead = broker.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "smtp down");
    }

    #[tokio::test]
    async fn zero_budget_still_runs_once() {
        let broker = InMemoryBroker::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(broker.clone());
        let counter = calls.clone();
        processor.register_typed("task:ping", move |_: Ping| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::retryable("nope"))
            }
        });

        enqueue(&broker, "task:ping", br#"{"n":1}"#, JobOptions::new().max_retry(0)).await;

        drain(&processor, &broker).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_retry_from_handler_discards() {
        let broker = InMemoryBroker::arc();
        let mut processor = TaskProcessor::new(broker.clone());
        processor.register_typed("task:ping", |_: Ping| async {
            Err(HandlerError::skip_retry("recipient rejected"))
        });

        enqueue(&broker, "task:ping", br#"{"n":1}"#, JobOptions::new()).await;

        let status = drain(&processor, &broker).await.unwrap();
        assert_eq!(
            status,
            JobStatus::Discarded {
                error: "recipient rejected".to_string()
            }
        );
    }

    #[tokio::test]
    async fn prefix_pattern_routes_unknown_types() {
        let broker = InMemoryBroker::arc();
        let mut processor = TaskProcessor::new(broker.clone());
        processor.register_typed("task:*", |_: serde_json::Value| async { Ok(()) });
        processor.register_typed("*", |_: serde_json::Value| async {
            Err(HandlerError::skip_retry("catch-all"))
        });

        enqueue(&broker, "task:anything", b"{}", JobOptions::new()).await;
        assert_eq!(drain(&processor, &broker).await, Some(JobStatus::Completed));

        enqueue(&broker, "report:weekly", b"{}", JobOptions::new()).await;
        assert!(matches!(
            drain(&processor, &broker).await,
            Some(JobStatus::Discarded { .. })
        ));
    }

    #[tokio::test]
    async fn missing_handler_is_retried() {
        let broker = InMemoryBroker::arc();
        let processor = TaskProcessor::new(broker.clone());

        enqueue(&broker, "task:orphan", b"{}", JobOptions::new().max_retry(2)).await;

        let job = broker.claim_next(&queues()).await.unwrap().unwrap();
        let status = processor.process_one(job).await.unwrap();
        assert!(matches!(status, JobStatus::Retrying { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn workers_process_every_job_once() {
        let broker = InMemoryBroker::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(broker.clone());
        let counter = calls.clone();
        processor.register_typed("task:ping", move |_: Ping| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for n in 0..20 {
            let payload = serde_json::to_vec(&Ping { n }).unwrap();
            enqueue(&broker, "task:ping", &payload, JobOptions::new()).await;
        }

        let handle = processor.spawn(
            ProcessorConfig::default()
                .with_concurrency(4)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..400 {
            if handle.stats().jobs_succeeded == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(stats.jobs_succeeded, 20);
        assert_eq!(broker.stats().await.unwrap().completed, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_as_retryable() {
        let broker = InMemoryBroker::arc();
        let mut processor = TaskProcessor::new(broker.clone());
        processor.register_typed("task:ping", |_: Ping| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        processor.handler_timeout = Some(Duration::from_secs(1));

        enqueue(&broker, "task:ping", br#"{"n":1}"#, JobOptions::new().max_retry(3)).await;

        let job = broker.claim_next(&queues()).await.unwrap().unwrap();
        let status = processor.process_one(job).await.unwrap();
        assert!(matches!(status, JobStatus::Retrying { .. }));
    }
}
