use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::models::job::{InvalidTransition, NewJob, TransformResult, UpscaleJob};

/// How long terminal jobs are kept before `purge_expired` drops them.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub completed_ttl: Duration,
    /// Upper bound on retained completed jobs; the oldest go first.
    pub completed_max: usize,
    pub failed_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_ttl: Duration::hours(24),
            completed_max: 1000,
            failed_ttl: Duration::days(7),
        }
    }
}

/// Durable, priority-ordered store of upscale jobs.
///
/// Lower `priority` values are claimed first, FIFO within a priority.
/// `claim_next` must be atomic: a job is handed to exactly one caller.
/// `complete`, `retry` and `fail` only apply to jobs in `processing`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new pending job and return its id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError>;

    /// Point-in-time view of a job.
    async fn get(&self, job_id: Uuid) -> Result<Option<UpscaleJob>, QueueError>;

    /// Take the next ready job and mark it processing.
    async fn claim_next(&self) -> Result<Option<UpscaleJob>, QueueError>;

    async fn complete(
        &self,
        job_id: Uuid,
        result: TransformResult,
    ) -> Result<UpscaleJob, QueueError>;

    /// Put a processing job back to pending, claimable again after `delay`.
    async fn retry(&self, job_id: Uuid, delay: std::time::Duration)
        -> Result<UpscaleJob, QueueError>;

    async fn fail(&self, job_id: Uuid, error: String) -> Result<UpscaleJob, QueueError>;

    /// Number of pending jobs, including those waiting out a retry delay.
    async fn queue_depth(&self) -> Result<u64, QueueError>;

    /// Drop terminal jobs past their retention. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, QueueError>;

    /// Check backend connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}
