use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{
    ImageSource, JobInput, JobStatus, NewJob, TransformParams, TransformResult, UpscaleJob,
};

pub const DEFAULT_PRIORITY: u8 = 5;

/// Request to submit an image for upscaling.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[garde(url, length(max = 2048))]
    pub image_url: Option<String>,

    /// Base64 or data URI, at most 10 MiB encoded.
    #[garde(length(min = 1, max = 10485760))]
    pub image_data: Option<String>,

    #[garde(range(min = 2, max = 8))]
    pub scale: u8,

    #[serde(default)]
    #[garde(skip)]
    pub enhance_face: bool,

    #[serde(default)]
    #[garde(skip)]
    pub denoise: bool,

    #[serde(default)]
    #[garde(skip)]
    pub remove_artifacts: bool,

    #[garde(url, length(max = 2048))]
    pub webhook_url: Option<String>,

    #[garde(range(max = 10))]
    pub priority: Option<u8>,
}

/// Identity attached by the upstream auth layer.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub api_key_id: String,
    pub user_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("{0}")]
    Invalid(#[from] garde::Report),

    #[error("exactly one of imageUrl or imageData is required")]
    ImageSource,

    #[error("{field} must use http or https")]
    Scheme { field: &'static str },
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

impl SubmitRequest {
    /// Validate the request and turn it into a typed job input.
    pub fn into_new_job(self, caller: CallerIdentity) -> Result<NewJob, SubmissionError> {
        self.validate()?;

        let source = match (self.image_url, self.image_data) {
            (Some(url), None) => {
                if !is_http_url(&url) {
                    return Err(SubmissionError::Scheme { field: "imageUrl" });
                }
                ImageSource::Url(url)
            }
            (None, Some(data)) => ImageSource::Inline(data),
            _ => return Err(SubmissionError::ImageSource),
        };

        if let Some(url) = &self.webhook_url {
            if !is_http_url(url) {
                return Err(SubmissionError::Scheme { field: "webhookUrl" });
            }
        }

        let params = TransformParams {
            source,
            scale: self.scale,
            denoise: self.denoise,
            remove_artifacts: self.remove_artifacts,
        };
        let input = if self.enhance_face {
            JobInput::FaceEnhance(params)
        } else {
            JobInput::Upscale(params)
        };

        Ok(NewJob {
            api_key_id: caller.api_key_id,
            user_id: caller.user_id,
            input,
            webhook_url: self.webhook_url,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
        })
    }
}

/// Response after submitting a job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub input: JobInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TransformResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
}

impl From<&UpscaleJob> for JobStatusResponse {
    fn from(job: &UpscaleJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            input: job.input.redacted(),
            result: job.result.clone(),
            error: job.error.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            processing_time: job.processing_time_ms(),
        }
    }
}
