use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::job::{TransformResult, UpscaleJob};
use crate::models::webhook::{WebhookEvent, WebhookPayload};
use crate::services::image_source::ImageFetcher;
use crate::services::inference::{InferenceProvider, InferenceRequest};
use crate::services::queue::{JobStore, QueueError};
use crate::services::retry::RetryPolicy;
use crate::services::webhook::WebhookDispatcher;

/// What happened to one attempt at a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(TransformResult),
    RetryableError(String),
    PermanentError(String),
}

impl JobOutcome {
    fn from_error(transient: bool, error: impl std::fmt::Display) -> Self {
        if transient {
            JobOutcome::RetryableError(error.to_string())
        } else {
            JobOutcome::PermanentError(error.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Jobs processed at the same time.
    pub concurrency: usize,
    /// Jobs admitted into the pool per second, independent of `concurrency`.
    pub jobs_per_second: u32,
    /// Concurrent calls allowed against the inference provider.
    pub provider_concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Emit `job.processing` before work starts.
    pub notify_processing: bool,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            jobs_per_second: 10,
            provider_concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            notify_processing: true,
            retry: RetryPolicy::jobs(),
        }
    }
}

impl PoolConfig {
    fn dispatch_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.jobs_per_second.max(1)))
    }
}

/// Fixed-size pool of job consumers.
///
/// Built once at startup and shared behind an `Arc`. The dispatch loop takes
/// a concurrency permit, waits for the throughput ticker, then claims a job
/// and runs it on its own task for as long as the permit is held.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    inference: Arc<dyn InferenceProvider>,
    images: ImageFetcher,
    webhooks: WebhookDispatcher,
    provider_slots: Arc<Semaphore>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        inference: Arc<dyn InferenceProvider>,
        images: ImageFetcher,
        webhooks: WebhookDispatcher,
        config: PoolConfig,
    ) -> Self {
        let provider_slots = Arc::new(Semaphore::new(config.provider_concurrency.max(1)));
        Self {
            store,
            inference,
            images,
            webhooks,
            provider_slots,
            config,
        }
    }

    /// Free inference-provider slots right now.
    pub fn provider_slots_available(&self) -> usize {
        self.provider_slots.available_permits()
    }

    /// Claim and process jobs until `shutdown` fires, then drain in-flight work.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut throughput = interval(self.config.dispatch_interval());
        throughput.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        tracing::info!(
            concurrency = self.config.concurrency,
            jobs_per_second = self.config.jobs_per_second,
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = throughput.tick() => {}
            }

            match self.store.claim_next().await {
                Ok(Some(job)) => {
                    let pool = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        pool.process(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No jobs available, sleeping");
                    self.idle(&shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim job, will retry");
                    self.idle(&shutdown).await;
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Job task panicked");
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Worker pool stopping, draining in-flight jobs");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(self.config.poll_interval) => {}
        }
    }

    /// Run one claimed job to its next state and announce the change.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempts))]
    pub async fn process(&self, job: UpscaleJob) {
        tracing::info!(variant = %job.input.model_variant(), "Processing upscale job");

        if self.config.notify_processing {
            self.notify(WebhookEvent::JobProcessing, &job).await;
        }

        let outcome = self.execute(&job).await;
        if let Err(e) = self.finalize(&job, outcome).await {
            tracing::error!(error = %e, "Failed to record job outcome");
        }
    }

    /// Normalize the source, call the provider and assemble the result.
    ///
    /// The provider slot taken here is released when this returns, on every path.
    pub async fn execute(&self, job: &UpscaleJob) -> JobOutcome {
        let Ok(_slot) = Arc::clone(&self.provider_slots).acquire_owned().await else {
            return JobOutcome::RetryableError("inference provider slots closed".to_string());
        };

        let start = Instant::now();
        let params = job.input.params();

        let image = match self.images.resolve(&params.source).await {
            Ok(image) => image,
            Err(e) => return JobOutcome::from_error(e.is_transient(), e),
        };

        let variant = job.input.model_variant();
        tracing::debug!(%variant, width = image.width, height = image.height, "Calling inference provider");
        let output = match self
            .inference
            .run(InferenceRequest {
                variant,
                image: &image,
                params,
            })
            .await
        {
            Ok(output) => output,
            Err(e) => return JobOutcome::from_error(e.is_transient(), e),
        };

        let scale = u32::from(params.scale);
        let (output_width, output_height, output_size) =
            match self.images.resolve_reference(&output.artifact).await {
                Ok(artifact) => (
                    artifact.width,
                    artifact.height,
                    Some(artifact.bytes.len() as u64),
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not probe output artifact");
                    (image.width * scale, image.height * scale, None)
                }
            };

        JobOutcome::Success(TransformResult {
            output_url: output.artifact,
            original_width: image.width,
            original_height: image.height,
            output_width,
            output_height,
            output_size,
            processing_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn finalize(&self, job: &UpscaleJob, outcome: JobOutcome) -> Result<(), QueueError> {
        match outcome {
            JobOutcome::Success(result) => {
                metrics::histogram!("upscale_processing_seconds")
                    .record(result.processing_time_ms as f64 / 1000.0);
                let done = self.store.complete(job.id, result).await?;
                metrics::counter!("upscale_jobs_completed_total").increment(1);
                tracing::info!(
                    processing_time_ms = done.result.as_ref().map(|r| r.processing_time_ms),
                    "Job completed successfully"
                );
                self.notify(WebhookEvent::JobCompleted, &done).await;
            }
            JobOutcome::RetryableError(reason)
                if self.config.retry.has_attempts_left(job.attempts) =>
            {
                let delay = self.config.retry.delay_after(job.attempts);
                self.store.retry(job.id, delay).await?;
                metrics::counter!("upscale_jobs_retried_total").increment(1);
                tracing::warn!(
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Job re-queued for retry"
                );
            }
            JobOutcome::RetryableError(reason) => {
                let message = format!(
                    "Processing failed after {} attempts: {}",
                    job.attempts, reason
                );
                self.fail(job, message).await?;
            }
            JobOutcome::PermanentError(reason) => {
                self.fail(job, reason).await?;
            }
        }
        Ok(())
    }

    async fn fail(&self, job: &UpscaleJob, error: String) -> Result<(), QueueError> {
        let failed = self.store.fail(job.id, error).await?;
        metrics::counter!("upscale_jobs_failed_total").increment(1);
        tracing::warn!(error = ?failed.error, "Job failed");
        self.notify(WebhookEvent::JobFailed, &failed).await;
        Ok(())
    }

    /// Best effort: the delivery result never changes job state.
    async fn notify(&self, event: WebhookEvent, job: &UpscaleJob) {
        if let Some(url) = &job.webhook_url {
            let payload = WebhookPayload::for_job(event, job);
            self.webhooks.send(url, &payload).await;
        }
    }
}
