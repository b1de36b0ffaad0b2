//! Broker abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::types::{DEFAULT_LEASE, DeadLetterEntry, Job, JobId, JobStatus};

/// Durable home of queued jobs, shared by producers and consumers.
///
/// Delivery is at-least-once: a claimed job is invisible to other claimers
/// until the claimer reports an outcome or its lease runs out. An expired
/// lease counts as a failed invocation.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Claim the next ready job, scanning `queues` in priority order.
    ///
    /// The returned job is already marked running with its attempt counter bumped.
    async fn claim_next(&self, queues: &[String]) -> Result<Option<Job>, BrokerError>;

    async fn complete(&self, job: &Job) -> Result<(), BrokerError>;

    /// Store a failed job and make it claimable again at `at`.
    async fn retry(&self, job: &Job, at: DateTime<Utc>) -> Result<(), BrokerError>;

    /// Park a job that ran out of invocations.
    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), BrokerError>;

    /// Drop a job that must not be retried. Discarded jobs never reach the DLQ.
    async fn discard(&self, job: Job, reason: String) -> Result<(), BrokerError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError>;

    /// Move a dead-lettered job back to its queue with a fresh attempt budget.
    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<Job, BrokerError>;

    async fn stats(&self) -> Result<JobStats, BrokerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job record could not be (de)serialized: {0}")]
    Serialization(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Queue depth by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    pub discarded: usize,
}

/// In-memory broker for tests/dev. Jobs do not survive a restart.
///
/// Finished jobs are dropped; only their counts are kept.
#[derive(Debug)]
pub struct InMemoryBroker {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    completed: AtomicUsize,
    discarded: AtomicUsize,
    lease: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            jobs: RwLock::default(),
            dead_letters: RwLock::default(),
            completed: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            lease: DEFAULT_LEASE,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Every queued or running job, oldest first.
    pub fn snapshot(&self) -> Result<Vec<Job>, BrokerError> {
        let mut jobs: Vec<Job> = self.jobs_read()?.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, BrokerError> {
        self.jobs.write().map_err(|_| poisoned())
    }

    fn jobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, BrokerError> {
        self.jobs.read().map_err(|_| poisoned())
    }

    fn dead_letters(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, BrokerError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }

    fn store(&self, job: &Job) -> Result<(), BrokerError> {
        let mut jobs = self.jobs()?;
        let slot = jobs.get_mut(&job.id).ok_or(BrokerError::NotFound(job.id))?;
        *slot = job.clone();
        Ok(())
    }

    /// Drop a finished job. A second report for the same job is not counted again.
    fn finish(&self, job_id: JobId, counter: &AtomicUsize) -> Result<(), BrokerError> {
        if self.jobs()?.remove(&job_id).is_some() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Hand expired claims back to their queue, or to the DLQ when out of invocations.
    fn reap_expired(
        &self,
        jobs: &mut HashMap<JobId, Job>,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        for id in expired {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            job.mark_lease_expired();
            warn!(job_id = %id, attempt = job.attempt, "job lease expired");

            if let JobStatus::DeadLettered { error, .. } = &job.status {
                let reason = error.clone();
                if let Some(job) = jobs.remove(&id) {
                    self.dead_letters()?.insert(id, DeadLetterEntry::new(job, reason));
                }
            }
        }
        Ok(())
    }
}

fn poisoned() -> BrokerError {
    BrokerError::Unavailable("broker lock poisoned".to_string())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        let mut jobs = self.jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(BrokerError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        if let Some(job) = self.jobs_read()?.get(&job_id) {
            return Ok(Some(job.clone()));
        }
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        Ok(dls.get(&job_id).map(|entry| entry.job.clone()))
    }

    async fn claim_next(&self, queues: &[String]) -> Result<Option<Job>, BrokerError> {
        let mut jobs = self.jobs()?;
        self.reap_expired(&mut jobs, Utc::now())?;
        let now = Utc::now();

        // Earlier queue in `queues` wins, then the longest-waiting job.
        let next = jobs
            .values()
            .filter(|j| j.status.is_claimable() && j.is_ready(now))
            .filter_map(|j| {
                let rank = queues.iter().position(|q| q == j.queue())?;
                Some((rank, j.ready_at(), j.id))
            })
            .min()
            .map(|(_, _, id)| id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.claim(self.lease);
                job.clone()
            })
        }))
    }

    async fn complete(&self, job: &Job) -> Result<(), BrokerError> {
        self.finish(job.id, &self.completed)
    }

    async fn retry(&self, job: &Job, at: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut job = job.clone();
        job.scheduled_at = Some(at);
        if !job.status.is_claimable() {
            job.status = JobStatus::Pending;
        }
        self.store(&job)
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), BrokerError> {
        let mut jobs = self.jobs()?;
        let mut dls = self.dead_letters()?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    async fn discard(&self, job: Job, _reason: String) -> Result<(), BrokerError> {
        self.finish(job.id, &self.discarded)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<Job, BrokerError> {
        let mut jobs = self.jobs()?;
        let mut dls = self.dead_letters()?;

        let entry = dls.remove(&job_id).ok_or(BrokerError::NotFound(job_id))?;
        let mut job = entry.job;
        job.reset();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn stats(&self) -> Result<JobStats, BrokerError> {
        let jobs = self.jobs_read()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying { .. } => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Discarded { .. } => stats.discarded += 1,
            }
        }
        stats.dead_lettered += dls.len();
        stats.completed += self.completed.load(Ordering::Relaxed);
        stats.discarded += self.discarded.load(Ordering::Relaxed);

        Ok(stats)
    }
}
