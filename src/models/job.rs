use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Status of an upscale job in the async queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Where the worker reads the source image from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Remote http(s) URL fetched by the worker.
    Url(String),
    /// Base64 payload, optionally wrapped in a `data:` URI.
    Inline(String),
}

impl ImageSource {
    /// Copy suitable for status responses: inline payloads are replaced by their size.
    pub fn redacted(&self) -> ImageSource {
        match self {
            ImageSource::Url(url) => ImageSource::Url(url.clone()),
            ImageSource::Inline(data) => ImageSource::Inline(format!("<{} bytes>", data.len())),
        }
    }
}

/// Parameters shared by every transform variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformParams {
    pub source: ImageSource,
    pub scale: u8,
    #[serde(default)]
    pub denoise: bool,
    #[serde(default)]
    pub remove_artifacts: bool,
}

/// Validated job input. One variant per transform type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobInput {
    /// General-purpose super-resolution.
    Upscale(TransformParams),
    /// Upscale with face restoration.
    FaceEnhance(TransformParams),
}

impl JobInput {
    pub fn params(&self) -> &TransformParams {
        match self {
            JobInput::Upscale(params) | JobInput::FaceEnhance(params) => params,
        }
    }

    pub fn model_variant(&self) -> ModelVariant {
        match self {
            JobInput::Upscale(_) => ModelVariant::GeneralUpscale,
            JobInput::FaceEnhance(_) => ModelVariant::FaceRestoration,
        }
    }

    pub fn redacted(&self) -> JobInput {
        let redact = |params: &TransformParams| TransformParams {
            source: params.source.redacted(),
            ..params.clone()
        };
        match self {
            JobInput::Upscale(params) => JobInput::Upscale(redact(params)),
            JobInput::FaceEnhance(params) => JobInput::FaceEnhance(redact(params)),
        }
    }
}

/// Inference model family selected for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ModelVariant {
    GeneralUpscale,
    FaceRestoration,
}

/// Output of a successful transform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    pub output_url: String,
    pub original_width: u32,
    pub original_height: u32,
    pub output_width: u32,
    pub output_height: u32,
    /// Artifact size in bytes, when the artifact could be downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    pub processing_time_ms: u64,
}

/// Submission accepted at the API boundary, not yet stored.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub api_key_id: String,
    pub user_id: String,
    pub input: JobInput,
    pub webhook_url: Option<String>,
    pub priority: u8,
}

/// An upscale job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleJob {
    pub id: Uuid,
    pub api_key_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub input: JobInput,
    pub result: Option<TransformResult>,
    pub error: Option<String>,
    pub webhook_url: Option<String>,
    pub priority: u8,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl UpscaleJob {
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key_id: job.api_key_id,
            user_id: job.user_id,
            status: JobStatus::Pending,
            input: job.input,
            result: None,
            error: None,
            webhook_url: job.webhook_url,
            priority: job.priority,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, from: JobStatus, to: JobStatus) -> Result<(), InvalidTransition> {
        if self.status != from {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// pending -> processing. Counts one attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Pending, JobStatus::Processing)?;
        self.attempts += 1;
        self.started_at = Some(now);
        Ok(())
    }

    /// processing -> completed.
    pub fn complete(
        &mut self,
        result: TransformResult,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing, JobStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// processing -> pending, ahead of a retry.
    pub fn requeue(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing, JobStatus::Pending)
    }

    /// processing -> failed.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing, JobStatus::Failed)?;
        self.result = None;
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Wall time between the last claim and the terminal transition.
    pub fn processing_time_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}
