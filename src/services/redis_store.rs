use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::models::job::{JobStatus, NewJob, TransformResult, UpscaleJob};
use crate::services::queue::{JobStore, QueueError, RetentionPolicy};

/// Score distance between priority tiers in the ready set.
const PRIORITY_SPAN: f64 = 1e12;

/// Delayed jobs promoted (and stale leases recovered) per claim attempt.
const PROMOTE_BATCH: isize = 100;

/// Default time a worker may hold a claimed job before it is handed out again.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

/// Pop the lowest-scored ready id and record its lease in one step.
const CLAIM_SCRIPT: &str = r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return popped[1]
";

fn ready_score(priority: u8, seq: u64) -> f64 {
    f64::from(priority) * PRIORITY_SPAN + seq as f64
}

/// Redis-backed job store.
///
/// Layout under `prefix`:
/// - `job:{id}`: JSON job record, given a TTL once terminal
/// - `ready`: sorted set of claimable ids scored by priority then sequence
/// - `delayed`: sorted set of retrying ids scored by ready time (ms)
/// - `processing`: sorted set of claimed ids scored by lease expiry (ms)
/// - `completed`: sorted set of completed ids scored by completion time (ms)
/// - `seq`: enqueue counter
///
/// A claimed id moves from `ready` to `processing` atomically. If its worker
/// never finalizes the job, the expired lease puts it back in `ready`.
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    retention: RetentionPolicy,
    lease: Duration,
    claim_script: redis::Script,
}

impl RedisJobStore {
    pub fn new(
        redis_url: &str,
        prefix: &str,
        retention: RetentionPolicy,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            retention,
            lease: DEFAULT_LEASE,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    /// Set how long a claim is held before the job is reclaimable.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: Uuid,
    ) -> Result<UpscaleJob, QueueError> {
        let payload: Option<String> = conn.get(self.job_key(job_id)).await?;
        let payload = payload.ok_or(QueueError::NotFound(job_id))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn save(
        &self,
        conn: &mut MultiplexedConnection,
        job: &UpscaleJob,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let key = self.job_key(job.id);

        let ttl = match job.status {
            JobStatus::Completed => Some(self.retention.completed_ttl),
            JobStatus::Failed => Some(self.retention.failed_ttl),
            JobStatus::Pending | JobStatus::Processing => None,
        };
        match ttl {
            Some(ttl) => {
                let seconds = ttl.num_seconds().max(1) as u64;
                conn.set_ex::<_, _, ()>(key, payload, seconds).await?;
            }
            None => conn.set::<_, _, ()>(key, payload).await?,
        }
        Ok(())
    }

    async fn push_ready(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: Uuid,
        priority: u8,
    ) -> Result<(), QueueError> {
        let seq: u64 = conn.incr(self.key("seq"), 1).await?;
        conn.zadd::<_, _, _, ()>(self.key("ready"), job_id.to_string(), ready_score(priority, seq))
            .await?;
        Ok(())
    }

    /// Move retrying jobs whose delay has passed into the ready set.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let delayed_key = self.key("delayed");
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(&delayed_key, "-inf", now_ms, 0, PROMOTE_BATCH)
            .await?;

        for member in due {
            // ZREM succeeds for exactly one contender.
            let removed: i64 = conn.zrem(&delayed_key, &member).await?;
            if removed != 1 {
                continue;
            }
            let Ok(job_id) = Uuid::parse_str(&member) else {
                tracing::warn!(member = %member, "Dropping malformed delayed entry");
                continue;
            };
            match self.load(conn, job_id).await {
                Ok(job) => self.push_ready(conn, job_id, job.priority).await?,
                Err(QueueError::NotFound(_)) => {
                    tracing::warn!(job_id = %job_id, "Delayed job record missing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Put jobs whose lease ran out back in the ready set.
    async fn recover_stale(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let processing_key = self.key("processing");
        let now_ms = Utc::now().timestamp_millis();
        let stale: Vec<String> = conn
            .zrangebyscore_limit(&processing_key, "-inf", now_ms, 0, PROMOTE_BATCH)
            .await?;

        for member in stale {
            let removed: i64 = conn.zrem(&processing_key, &member).await?;
            if removed != 1 {
                continue;
            }
            let Ok(job_id) = Uuid::parse_str(&member) else {
                tracing::warn!(member = %member, "Dropping malformed processing entry");
                continue;
            };
            let mut job = match self.load(conn, job_id).await {
                Ok(job) => job,
                Err(QueueError::NotFound(_)) => {
                    tracing::warn!(job_id = %job_id, "Leased job record missing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match job.status {
                JobStatus::Completed | JobStatus::Failed => continue,
                JobStatus::Processing => {
                    job.requeue()?;
                    self.save(conn, &job).await?;
                }
                JobStatus::Pending => {}
            }
            tracing::warn!(job_id = %job_id, attempts = job.attempts, "Job lease expired, re-queued");
            self.push_ready(conn, job_id, job.priority).await?;
        }
        Ok(())
    }

    async fn release(&self, conn: &mut MultiplexedConnection, job_id: Uuid) -> Result<(), QueueError> {
        conn.zrem::<_, _, ()>(self.key("processing"), job_id.to_string())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let mut conn = self.connection().await?;
        let job = UpscaleJob::new(job, Utc::now());

        self.save(&mut conn, &job).await?;
        self.push_ready(&mut conn, job.id, job.priority).await?;
        Ok(job.id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<UpscaleJob>, QueueError> {
        let mut conn = self.connection().await?;
        match self.load(&mut conn, job_id).await {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn claim_next(&self) -> Result<Option<UpscaleJob>, QueueError> {
        let mut conn = self.connection().await?;
        self.recover_stale(&mut conn).await?;
        self.promote_due(&mut conn).await?;

        let lease_until = Utc::now().timestamp_millis() + self.lease.as_millis() as i64;
        let claimed: Option<String> = self
            .claim_script
            .key(self.key("ready"))
            .key(self.key("processing"))
            .arg(lease_until)
            .invoke_async(&mut conn)
            .await?;
        let Some(member) = claimed else {
            return Ok(None);
        };
        let job_id = match Uuid::parse_str(&member) {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(member = %member, "Dropping malformed ready entry");
                conn.zrem::<_, _, ()>(self.key("processing"), &member).await?;
                return Ok(None);
            }
        };

        // Until the save below succeeds the lease is the only record of this
        // claim; on error it expires and the job is re-queued.
        let mut job = match self.load(&mut conn, job_id).await {
            Ok(job) => job,
            Err(QueueError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Ready job record missing");
                self.release(&mut conn, job_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        job.claim(Utc::now())?;
        self.save(&mut conn, &job).await?;
        Ok(Some(job))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        result: TransformResult,
    ) -> Result<UpscaleJob, QueueError> {
        let mut conn = self.connection().await?;
        let mut job = self.load(&mut conn, job_id).await?;
        let now = Utc::now();
        job.complete(result, now)?;
        self.save(&mut conn, &job).await?;
        self.release(&mut conn, job_id).await?;
        conn.zadd::<_, _, _, ()>(self.key("completed"), job_id.to_string(), now.timestamp_millis())
            .await?;
        Ok(job)
    }

    async fn retry(
        &self,
        job_id: Uuid,
        delay: std::time::Duration,
    ) -> Result<UpscaleJob, QueueError> {
        let mut conn = self.connection().await?;
        let mut job = self.load(&mut conn, job_id).await?;
        job.requeue()?;
        self.save(&mut conn, &job).await?;

        // Delayed first, so a crash between the two writes leaves the job
        // queued rather than unowned.
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(self.key("delayed"), job_id.to_string(), ready_at)
            .await?;
        self.release(&mut conn, job_id).await?;
        Ok(job)
    }

    async fn fail(&self, job_id: Uuid, error: String) -> Result<UpscaleJob, QueueError> {
        let mut conn = self.connection().await?;
        let mut job = self.load(&mut conn, job_id).await?;
        job.fail(error, Utc::now())?;
        self.save(&mut conn, &job).await?;
        self.release(&mut conn, job_id).await?;
        Ok(job)
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let ready: u64 = conn.zcard(self.key("ready")).await?;
        let delayed: u64 = conn.zcard(self.key("delayed")).await?;
        Ok(ready + delayed)
    }

    async fn purge_expired(&self) -> Result<u64, QueueError> {
        // Records expire through their TTL; only the completed index needs trimming.
        let mut conn = self.connection().await?;
        let completed_key = self.key("completed");

        let cutoff = (Utc::now() - self.retention.completed_ttl).timestamp_millis();
        let expired: u64 = conn.zrembyscore(&completed_key, "-inf", cutoff).await?;

        let count: usize = conn.zcard(&completed_key).await?;
        let mut trimmed = 0u64;
        if count > self.retention.completed_max {
            let excess = (count - self.retention.completed_max) as isize;
            let oldest: Vec<String> = conn.zrange(&completed_key, 0, excess - 1).await?;
            for member in &oldest {
                if let Ok(job_id) = Uuid::parse_str(member) {
                    trimmed += conn.del::<_, u64>(self.job_key(job_id)).await?;
                }
            }
            conn.zremrangebyrank::<_, ()>(&completed_key, 0, excess - 1)
                .await?;
        }

        if expired + trimmed > 0 {
            tracing::info!(expired, trimmed, "Purged completed jobs");
        }
        Ok(trimmed)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_score_orders_priority_before_sequence() {
        assert!(ready_score(1, 999_999) < ready_score(2, 1));
        assert!(ready_score(3, 10) < ready_score(3, 11));
    }
}
