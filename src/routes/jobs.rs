use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::submission::{
    CallerIdentity, JobStatusResponse, SubmissionError, SubmitRequest, SubmitResponse,
};
use crate::services::queue::QueueError;

/// Headers set by the upstream auth layer.
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing caller identity")]
    Unauthorized,

    #[error(transparent)]
    Validation(#[from] SubmissionError),

    #[error("invalid request body: {}", .0.body_text())]
    Body(#[from] JsonRejection),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job store unavailable: {0}")]
    Store(#[from] QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "Validation Error"),
            // Undeserializable fields are validation errors; syntax, media
            // type and size problems keep their own status.
            ApiError::Body(rejection) => {
                let status = rejection.status();
                let error = if status == StatusCode::UNPROCESSABLE_ENTITY {
                    "Validation Error"
                } else {
                    status.canonical_reason().unwrap_or("Bad Request")
                };
                (status, error)
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Job store request failed");
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
        };
        let body = json!({ "error": error, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

fn caller_identity(headers: &HeaderMap) -> Result<CallerIdentity, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    match (header(API_KEY_ID_HEADER), header(USER_ID_HEADER)) {
        (Some(api_key_id), Some(user_id)) => Ok(CallerIdentity {
            api_key_id,
            user_id,
        }),
        _ => Err(ApiError::Unauthorized),
    }
}

/// POST /api/v1/jobs — queue an image for upscaling.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let caller = caller_identity(&headers)?;
    let Json(request) = request?;
    let new_job = request.into_new_job(caller)?;
    let priority = new_job.priority;

    let job_id = state.store.enqueue(new_job).await?;
    metrics::counter!("upscale_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job_id, priority, "Upscale job queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
            message: "Image queued for upscaling".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — check job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let caller = caller_identity(&headers)?;
    let job = state
        .store
        .get(job_id)
        .await?
        .filter(|job| job.api_key_id == caller.api_key_id)
        .ok_or(ApiError::NotFound(job_id))?;

    Ok(Json(JobStatusResponse::from(&job)))
}
