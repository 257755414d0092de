use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::job::{JobStatus, NewJob, TransformResult, UpscaleJob};
use crate::services::queue::{JobStore, QueueError, RetentionPolicy};

/// In-process job store for tests and single-node runs.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    retention: RetentionPolicy,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, UpscaleJob>,
    /// (priority, sequence) -> job. Sequence keeps FIFO order within a tier.
    ready: BTreeMap<(u8, u64), Uuid>,
    /// Jobs waiting out a retry delay, with the time they become claimable.
    delayed: Vec<(DateTime<Utc>, Uuid)>,
    next_seq: u64,
}

impl MemoryState {
    fn push_ready(&mut self, priority: u8, job_id: Uuid) {
        self.next_seq += 1;
        self.ready.insert((priority, self.next_seq), job_id);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due = Vec::new();
        self.delayed.retain(|(ready_at, job_id)| {
            if *ready_at <= now {
                due.push((*ready_at, *job_id));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);

        for (_, job_id) in due {
            if let Some(priority) = self.jobs.get(&job_id).map(|job| job.priority) {
                self.push_ready(priority, job_id);
            }
        }
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut UpscaleJob, QueueError> {
        self.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))
    }
}

impl MemoryJobStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention,
        }
    }

    pub fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<UpscaleJob>, QueueError> {
        let mut state = self.state.lock();
        state.promote_due(now);

        let Some((_, job_id)) = state.ready.pop_first() else {
            return Ok(None);
        };
        let job = state.job_mut(job_id)?;
        job.claim(now)?;
        Ok(Some(job.clone()))
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        let retention = &self.retention;

        state.jobs.retain(|_, job| match (job.status, job.completed_at) {
            (JobStatus::Completed, Some(done)) => done + retention.completed_ttl > now,
            (JobStatus::Failed, Some(done)) => done + retention.failed_ttl > now,
            _ => true,
        });

        let mut completed: Vec<(DateTime<Utc>, Uuid)> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Completed)
            .filter_map(|job| job.completed_at.map(|done| (done, job.id)))
            .collect();
        if completed.len() > retention.completed_max {
            completed.sort();
            let excess = completed.len() - retention.completed_max;
            for (_, job_id) in completed.into_iter().take(excess) {
                state.jobs.remove(&job_id);
            }
        }

        (before - state.jobs.len()) as u64
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, QueueError> {
        let job = UpscaleJob::new(job, Utc::now());
        let job_id = job.id;
        let priority = job.priority;

        let mut state = self.state.lock();
        state.jobs.insert(job_id, job);
        state.push_ready(priority, job_id);
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<UpscaleJob>, QueueError> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<UpscaleJob>, QueueError> {
        self.claim_next_at(Utc::now())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        result: TransformResult,
    ) -> Result<UpscaleJob, QueueError> {
        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        job.complete(result, Utc::now())?;
        Ok(job.clone())
    }

    async fn retry(
        &self,
        job_id: Uuid,
        delay: std::time::Duration,
    ) -> Result<UpscaleJob, QueueError> {
        let ready_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        job.requeue()?;
        let job = job.clone();
        state.delayed.push((ready_at, job_id));
        Ok(job)
    }

    async fn fail(&self, job_id: Uuid, error: String) -> Result<UpscaleJob, QueueError> {
        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        job.fail(error, Utc::now())?;
        Ok(job.clone())
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock();
        Ok((state.ready.len() + state.delayed.len()) as u64)
    }

    async fn purge_expired(&self) -> Result<u64, QueueError> {
        Ok(self.purge_expired_at(Utc::now()))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
