use std::time::Duration;

use serde::Deserialize;

use crate::services::queue::RetentionPolicy;
use crate::services::retry::RetryPolicy;
use crate::services::worker::PoolConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape address for the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// Redis connection string for the job store
    pub redis_url: String,

    /// Key prefix for every job store key
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Prediction API base URL
    #[serde(default = "default_inference_base_url")]
    pub inference_base_url: String,

    /// Prediction API bearer token
    pub inference_api_token: String,

    /// Model used for plain upscales
    #[serde(default = "default_general_model")]
    pub general_model: String,

    /// Model used when face enhancement is requested
    #[serde(default = "default_face_model")]
    pub face_model: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Shared secret for webhook signatures
    pub webhook_secret: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    #[serde(default = "default_three")]
    pub webhook_max_attempts: u32,

    #[serde(default = "default_five")]
    pub worker_concurrency: usize,

    #[serde(default = "default_jobs_per_second")]
    pub worker_jobs_per_second: u32,

    #[serde(default = "default_five")]
    pub provider_concurrency: usize,

    #[serde(default = "default_three")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_true")]
    pub notify_processing: bool,

    /// How long a worker may hold a claimed job before it is re-queued
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: i64,

    #[serde(default = "default_completed_max_count")]
    pub completed_max_count: usize,

    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: i64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_queue_prefix() -> String {
    "upscale".to_string()
}

fn default_inference_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}

fn default_general_model() -> String {
    "nightmareai/real-esrgan".to_string()
}

fn default_face_model() -> String {
    "tencentarc/gfpgan".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    120
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_three() -> u32 {
    3
}

fn default_five() -> usize {
    5
}

fn default_jobs_per_second() -> u32 {
    10
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_job_lease_secs() -> u64 {
    600
}

fn default_completed_retention_hours() -> i64 {
    24
}

fn default_completed_max_count() -> usize {
    1000
}

fn default_failed_retention_days() -> i64 {
    7
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed_ttl: chrono::Duration::hours(self.completed_retention_hours),
            completed_max: self.completed_max_count,
            failed_ttl: chrono::Duration::days(self.failed_retention_days),
        }
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn webhook_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.webhook_max_attempts,
            ..RetryPolicy::webhooks()
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.worker_concurrency,
            jobs_per_second: self.worker_jobs_per_second,
            provider_concurrency: self.provider_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            notify_processing: self.notify_processing,
            retry: RetryPolicy::new(
                self.max_attempts,
                Duration::from_millis(self.retry_base_delay_ms),
            ),
        }
    }
}
