//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue for user-facing side effects; always drained first.
pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

/// How long a claim stays valid before the broker hands the job out again.
///
/// Must outlast the handler timeout, or healthy invocations get redelivered.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);

/// Unique job identifier; time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker
    Running,
    Completed,
    /// Last invocation failed; another one is scheduled
    Retrying { error: String, attempt: u32 },
    /// Out of invocations; parked for inspection/replay
    DeadLettered { error: String, attempts: u32 },
    /// Failed permanently without retry (malformed payload and the like)
    Discarded { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered { .. } | JobStatus::Discarded { .. }
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Spacing between invocations of a failing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Retry as soon as a worker is free.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the given failed invocation (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Per-job delivery options chosen by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Upper bound on handler invocations, the first one included.
    pub max_retry: u32,
    /// Minimum wait before the first invocation.
    pub delay: Duration,
    pub queue: String,
    pub backoff: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retry: 25,
            delay: Duration::ZERO,
            queue: QUEUE_DEFAULT.to_string(),
            backoff: RetryPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a job that has been invoked `attempt` times may run again.
    ///
    /// The first invocation always happens, even with `max_retry == 0`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retry
    }
}

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key to a registered handler, e.g. `task:send_verify_email`.
    pub job_type: String,
    /// Serialized payload, opaque to the queue.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Number of invocations started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Record of every invocation.
    pub history: Vec<JobAttemptRecord>,
    /// Set while claimed; past this instant the claim is void.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Job {
    pub fn new(job_type: impl Into<String>, payload: Vec<u8>, options: JobOptions) -> Self {
        let now = Utc::now();
        let scheduled_at = (!options.delay.is_zero()).then(|| after(now, options.delay));
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            options,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at,
            history: Vec::new(),
            lease_expires_at: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.options.queue
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Earliest instant the job may be claimed.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    /// Claim for one invocation lasting at most `lease`.
    pub fn claim(&mut self, lease: Duration) {
        self.mark_running();
        self.lease_expires_at = Some(after(self.updated_at, lease));
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| now > at)
    }

    /// The claimer never reported back: count the invocation as a retryable failure.
    pub fn mark_lease_expired(&mut self) {
        let started_at = self.updated_at;
        self.mark_failed("lease expired before the worker reported an outcome".to_string(), started_at);
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.record(started_at, now, None);
    }

    /// Record a failed invocation and either schedule the next one or
    /// move the job to `DeadLettered`.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.record(started_at, now, Some(error.clone()));

        if self.options.should_retry(self.attempt) {
            let delay = self.options.backoff.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(after(now, delay));
            self.status = JobStatus::Retrying {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Fail permanently, skipping any remaining retries.
    pub fn mark_discarded(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.record(started_at, now, Some(error.clone()));
        self.status = JobStatus::Discarded { error };
    }

    /// Reset a dead-lettered job so it gets a fresh set of invocations.
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.updated_at = Utc::now();
        self.history.clear();
    }

    fn record(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.lease_expires_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

/// Payload bytes travel as standard base64 inside the JSON job record.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(options: JobOptions) -> Job {
        Job::new("task:test", b"{}".to_vec(), options)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn max_retry_counts_every_invocation() {
        let options = JobOptions::new().max_retry(3);
        assert!(options.should_retry(1));
        assert!(options.should_retry(2));
        assert!(!options.should_retry(3));

        // Zero still allows the first run; it just never retries.
        assert!(!JobOptions::new().max_retry(0).should_retry(1));
    }

    #[test]
    fn delay_schedules_first_run() {
        let delayed = job(JobOptions::new().delay(Duration::from_secs(10)));
        assert!(!delayed.is_ready(delayed.created_at));
        assert!(delayed.is_ready(delayed.created_at + chrono::Duration::seconds(10)));

        let immediate = job(JobOptions::new());
        assert!(immediate.is_ready(immediate.created_at));
        assert_eq!(immediate.ready_at(), immediate.created_at);
    }

    #[test]
    fn failure_then_dead_letter() {
        let mut job = job(JobOptions::new().max_retry(2).backoff(RetryPolicy::immediate()));

        job.mark_running();
        job.mark_failed("boom 1".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::Retrying { attempt: 1, .. }));
        assert!(job.status.is_claimable());

        job.mark_running();
        job.mark_failed("boom 2".to_string(), Utc::now());
        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: "boom 2".to_string(),
                attempts: 2
            }
        );
        assert_eq!(job.history.len(), 2);
        assert!(job.history.iter().all(|r| !r.success));
    }

    #[test]
    fn discard_ignores_remaining_retries() {
        let mut job = job(JobOptions::new().max_retry(10));
        job.mark_running();
        job.mark_discarded("bad payload".to_string(), Utc::now());

        assert!(job.status.is_terminal());
        assert!(!job.status.is_claimable());
    }

    #[test]
    fn payload_is_base64_in_json() {
        let job = Job::new("task:test", vec![0, 159, 146, 150], JobOptions::new());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["payload"], "AJ+Slg==");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, job.payload);
    }

    #[test]
    fn expired_lease_counts_as_failed_invocation() {
        let mut job = job(JobOptions::new().max_retry(2).backoff(RetryPolicy::immediate()));
        job.claim(Duration::from_secs(30));
        let lease = job.lease_expires_at.unwrap();
        assert!(!job.lease_expired(lease));
        assert!(job.lease_expired(lease + chrono::Duration::milliseconds(1)));

        job.mark_lease_expired();
        assert!(matches!(job.status, JobStatus::Retrying { attempt: 1, .. }));
        assert_eq!(job.lease_expires_at, None);

        job.claim(Duration::from_secs(30));
        job.mark_lease_expired();
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
    }

    mod properties {
        use std::time::Duration;

        use proptest::prelude::*;

        use crate::jobs::types::{JobOptions, RetryPolicy};

        proptest! {
            #[test]
            fn backoff_stays_within_jittered_cap(
                base_ms in 0u64..10_000,
                extra_ms in 0u64..600_000,
                attempt in 0u32..200,
            ) {
                let max_ms = base_ms + extra_ms;
                let policy = RetryPolicy::exponential(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms),
                );
                let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
                prop_assert!(delay <= max_ms + max_ms / 10 + 1);
            }

            #[test]
            fn attempts_never_exceed_max_retry(max_retry in 0u32..50, attempt in 0u32..100) {
                let options = JobOptions::new().max_retry(max_retry);
                prop_assert_eq!(options.should_retry(attempt), attempt < max_retry);
            }
        }
    }
}
