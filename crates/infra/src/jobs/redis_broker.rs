//! Redis-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - `{prefix}:job:{id}`: JSON job record
//! - `{prefix}:queue:{name}`: sorted set of job ids scored by ready-at (unix ms)
//! - `{prefix}:running`: sorted set of claimed job ids scored by lease deadline (unix ms)
//! - `{prefix}:dead`: sorted set of dead-lettered ids scored by dead-letter time,
//!   with the entry itself at `{prefix}:dead:{id}`
//! - `{prefix}:corrupt`: set of ids whose record could not be decoded
//! - `{prefix}:stats:{completed,discarded}`: counters
//!
//! A claim moves the id from its queue to `running` in one script, so an id
//! is always in exactly one place. Ids whose lease has passed are taken back
//! by the next `claim_next` and count as a failed invocation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::{error, instrument, warn};

use super::broker::{Broker, BrokerError, JobStats};
use super::types::{
    DEFAULT_LEASE, DeadLetterEntry, Job, JobId, JobStatus, QUEUE_CRITICAL, QUEUE_DEFAULT,
};

const DEFAULT_PREFIX: &str = "snipstash";

/// Finished job records are kept this long for inspection.
const FINISHED_TTL_SECS: u64 = 24 * 60 * 60;

/// Expired leases recovered per `claim_next` call.
const REAP_BATCH: usize = 16;

/// KEYS: queue, running. ARGV: now (ms), lease deadline (ms).
const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
redis.call('ZREM', KEYS[1], ids[1])
redis.call('ZADD', KEYS[2], ARGV[2], ids[1])
return ids[1]
"#;

/// Extend an expired lease so exactly one caller recovers the job.
/// KEYS: running. ARGV: id, now (ms), new deadline (ms).
const RELEASE_SCRIPT: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if deadline and tonumber(deadline) <= tonumber(ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    prefix: String,
    queues: Vec<String>,
    lease: Duration,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .field("queues", &self.queues)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

fn unavailable(err: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, BrokerError> {
    serde_json::to_string(value).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, BrokerError> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> i64 {
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    score(now).saturating_add(lease_ms)
}

/// Last index for `ZRANGE 0 <stop>` returning at most `limit` entries.
fn range_stop(limit: usize) -> i64 {
    i64::try_from(limit).map_or(-1, |l| l - 1)
}

impl RedisBroker {
    /// Connect to `redis_url`, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            queues: vec![QUEUE_CRITICAL.to_string(), QUEUE_DEFAULT.to_string()],
            lease: DEFAULT_LEASE,
        })
    }

    /// How long a claim holds before the job is handed out again.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Queues counted by [`Broker::stats`].
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn corrupt_key(&self) -> String {
        format!("{}:corrupt", self.prefix)
    }

    fn dead_entry_key(&self, id: &str) -> String {
        format!("{}:dead:{}", self.prefix, id)
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:stats:{}", self.prefix, name)
    }

    /// Read the record of an id this caller holds in `running`.
    ///
    /// Missing or undecodable records leave `running`; undecodable ones are
    /// parked under `{prefix}:corrupt` for inspection.
    async fn load_leased(&self, id: &str) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let Some(raw) = raw else {
            warn!(job_id = %id, "claimed id without job record; dropped");
            redis::cmd("ZREM")
                .arg(self.running_key())
                .arg(id)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(unavailable)?;
            return Ok(None);
        };

        match decode::<Job>(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                error!(job_id = %id, error = %e, "undecodable job record; parked");
                redis::pipe()
                    .atomic()
                    .cmd("ZREM")
                    .arg(self.running_key())
                    .arg(id)
                    .ignore()
                    .cmd("SADD")
                    .arg(self.corrupt_key())
                    .arg(id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(unavailable)?;
                Ok(None)
            }
        }
    }

    /// Recover jobs whose claimer never reported back.
    async fn reap_expired(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let now = Utc::now();

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.running_key())
            .arg("-inf")
            .arg(score(now))
            .arg("LIMIT")
            .arg(0)
            .arg(REAP_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let release = redis::Script::new(RELEASE_SCRIPT);
        for id in expired {
            let won: i64 = release
                .key(self.running_key())
                .arg(&id)
                .arg(score(now))
                .arg(lease_deadline(now, self.lease))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if won == 0 {
                continue;
            }

            let Some(mut job) = self.load_leased(&id).await? else {
                continue;
            };
            job.mark_lease_expired();
            warn!(job_id = %id, attempt = job.attempt, "job lease expired");

            match &job.status {
                JobStatus::DeadLettered { error, .. } => {
                    let reason = error.clone();
                    self.dead_letter(job, reason).await?;
                }
                _ => {
                    let at = job.ready_at();
                    self.retry(&job, at).await?;
                }
            }
        }
        Ok(())
    }

    /// Persist a terminal job, drop it from the running set and bump `counter`.
    ///
    /// A late report for a job that was already handed out again also pulls
    /// the redelivered copy from its queue.
    async fn finish(&self, job: &Job, counter: &str) -> Result<(), BrokerError> {
        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&id))
            .arg(encode(job)?)
            .arg("EX")
            .arg(FINISHED_TTL_SECS)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(self.queue_key(job.queue()))
            .arg(&id)
            .ignore()
            .cmd("INCR")
            .arg(self.counter_key(counter))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue()), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        let id = job.id.to_string();
        let mut conn = self.conn.clone();

        let created: bool = redis::cmd("SET")
            .arg(self.job_key(&id))
            .arg(encode(&job)?)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(unavailable)?
            .is_some();
        if !created {
            return Err(BrokerError::AlreadyExists(job.id));
        }

        redis::cmd("ZADD")
            .arg(self.queue_key(job.queue()))
            .arg(score(job.ready_at()))
            .arg(&id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        let id = job_id.to_string();
        let mut conn = self.conn.clone();

        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(&id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if let Some(raw) = raw {
            return decode(&raw).map(Some);
        }

        let dead: Option<String> = redis::cmd("GET")
            .arg(self.dead_entry_key(&id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        dead.map(|raw| decode::<DeadLetterEntry>(&raw).map(|entry| entry.job))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, queues: &[String]) -> Result<Option<Job>, BrokerError> {
        self.reap_expired().await?;

        let mut conn = self.conn.clone();
        let claim = redis::Script::new(CLAIM_SCRIPT);

        for queue in queues {
            loop {
                let now = Utc::now();
                let id: Option<String> = claim
                    .key(self.queue_key(queue))
                    .key(self.running_key())
                    .arg(score(now))
                    .arg(lease_deadline(now, self.lease))
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                let Some(id) = id else {
                    break;
                };

                let Some(mut job) = self.load_leased(&id).await? else {
                    continue;
                };
                job.claim(self.lease);

                // Until this write lands the record still says pending; the
                // lease in `running` is what protects the claim.
                redis::cmd("SET")
                    .arg(self.job_key(&id))
                    .arg(encode(&job)?)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(unavailable)?;

                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn complete(&self, job: &Job) -> Result<(), BrokerError> {
        self.finish(job, "completed").await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt), err)]
    async fn retry(&self, job: &Job, at: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut job = job.clone();
        job.scheduled_at = Some(at);
        if !job.status.is_claimable() {
            job.status = JobStatus::Pending;
        }

        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&id))
            .arg(encode(&job)?)
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(job.queue()))
            .arg(score(at))
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), BrokerError> {
        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();
        let entry = DeadLetterEntry::new(job, reason);

        let id = entry.job.id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.dead_entry_key(&id))
            .arg(encode(&entry)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.dead_key())
            .arg(score(entry.dead_lettered_at))
            .arg(&id)
            .ignore()
            .cmd("DEL")
            .arg(self.job_key(&id))
            .ignore()
            .cmd("ZREM")
            .arg(self.running_key())
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn discard(&self, mut job: Job, reason: String) -> Result<(), BrokerError> {
        if !matches!(job.status, JobStatus::Discarded { .. }) {
            job.status = JobStatus::Discarded { error: reason };
            job.updated_at = Utc::now();
        }
        self.finish(&job, "discarded").await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();

        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.dead_key())
            .arg(0)
            .arg(range_stop(limit))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.dead_entry_key(id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        raws.into_iter().flatten().map(|raw| decode(&raw)).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<Job, BrokerError> {
        let id = job_id.to_string();
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("ZREM")
            .arg(self.dead_key())
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if removed == 0 {
            return Err(BrokerError::NotFound(job_id));
        }

        let raw: Option<String> = redis::cmd("GET")
            .arg(self.dead_entry_key(&id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let raw = raw.ok_or(BrokerError::NotFound(job_id))?;
        let mut job = decode::<DeadLetterEntry>(&raw)?.job;
        job.reset();

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&id))
            .arg(encode(&job)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(job.queue()))
            .arg(score(job.ready_at()))
            .arg(&id)
            .ignore()
            .cmd("DEL")
            .arg(self.dead_entry_key(&id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(job)
    }

    async fn stats(&self) -> Result<JobStats, BrokerError> {
        let mut conn = self.conn.clone();
        let count = |value: Option<i64>| value.unwrap_or(0).max(0) as usize;

        let mut pending = 0;
        for queue in &self.queues {
            let depth: i64 = redis::cmd("ZCARD")
                .arg(self.queue_key(queue))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            pending += depth.max(0) as usize;
        }

        let (running, dead, completed, discarded): (i64, i64, Option<i64>, Option<i64>) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(self.running_key())
                .cmd("ZCARD")
                .arg(self.dead_key())
                .cmd("GET")
                .arg(self.counter_key("completed"))
                .cmd("GET")
                .arg(self.counter_key("discarded"))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

        // Retrying jobs sit in their queue sorted set and are counted as pending.
        Ok(JobStats {
            pending,
            running: count(Some(running)),
            retrying: 0,
            completed: count(completed),
            dead_lettered: count(Some(dead)),
            discarded: count(discarded),
        })
    }
}
