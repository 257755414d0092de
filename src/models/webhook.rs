use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, TransformResult, UpscaleJob};

/// Job state change announced to a callback URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WebhookEvent {
    #[serde(rename = "job.processing")]
    JobProcessing,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::JobProcessing => "job.processing",
            WebhookEvent::JobCompleted => "job.completed",
            WebhookEvent::JobFailed => "job.failed",
        }
    }
}

/// JSON body POSTed to the caller's webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TransformResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// Snapshot of `job` tagged with `event`.
    pub fn for_job(event: WebhookEvent, job: &UpscaleJob) -> Self {
        Self {
            event,
            job_id: job.id,
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            timestamp: Utc::now(),
        }
    }
}
